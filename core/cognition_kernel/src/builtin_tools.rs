//! Tools registered at kernel startup.

use ail_types::{FileAccess, ToolCapabilities};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::tool_registry::{Handler, ToolRegistration};

pub const SHELL_TOOL: &str = "shell";
pub const JSON_FORMAT_TOOL: &str = "json_format";

pub const SHELL_DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// The shell tool runs its parameter as a command line through `sh -c`.
/// Parameters: a string, or an array of strings joined with spaces. The
/// timeout comes from `KernelConfig::shell_tool_timeout_ms`.
pub fn shell_tool(timeout_ms: u64) -> (ToolRegistration, Handler) {
    let registration = ToolRegistration::new(SHELL_TOOL, "run a shell command line")
        .with_capabilities(ToolCapabilities {
            blocking: false,
            reentrant: true,
            network_access: true,
            file_access: FileAccess::ReadWrite,
            memory_hint_mb: 128,
        })
        .with_timeout_ms(timeout_ms);

    let handler = Handler::cooperative(|params| async move {
        let command_line = shell_command_line(&params)?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .output()
            .await
            .map_err(|e| format!("failed to spawn shell: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(Value::String(
            String::from_utf8_lossy(&output.stdout).to_string(),
        ))
    });

    (registration, handler)
}

fn shell_command_line(params: &Value) -> Result<String, String> {
    match params {
        Value::String(s) => Ok(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if parts.len() != items.len() {
                return Err("shell parameters must be strings".to_string());
            }
            if parts.is_empty() {
                return Err("shell requires a command line".to_string());
            }
            Ok(parts.join(" "))
        }
        _ => Err("shell parameters must be a string or an array of strings".to_string()),
    }
}

/// Pretty-prints its parameter as JSON. Cooperative and reentrant.
pub fn json_format_tool() -> (ToolRegistration, Handler) {
    let registration = ToolRegistration::new(JSON_FORMAT_TOOL, "pretty-print a JSON value")
        .with_timeout_ms(1_000);

    let handler = Handler::cooperative(|params| async move {
        let pretty = serde_json::to_string_pretty(&params)
            .map_err(|e| format!("value is not representable as JSON: {e}"))?;
        Ok(json!(pretty))
    });

    (registration, handler)
}
