//! Pre-flight sandbox policy checks for SANDBOXED-EXECUTE.
//!
//! The policy is a contract, not an OS sandbox: the evaluator refuses tools
//! whose declared capabilities exceed the policy, and `cpu_limit_ms` becomes
//! the invocation timeout. Memory and CPU limits are advisory for the tool.

use std::collections::BTreeMap;

use ail_types::{AilValue, CognitionError, FileAccess, SandboxConfig, ToolCapabilities};
use serde::Deserialize;

/// Fields a policy map may override; everything absent keeps the default.
#[derive(Deserialize, Default)]
struct PartialPolicy {
    memory_limit_mb: Option<u32>,
    cpu_limit_ms: Option<u32>,
    network_access: Option<bool>,
    file_access: Option<FileAccess>,
    allowed_operations: Option<Vec<String>>,
}

/// Build the effective policy from SANDBOXED-EXECUTE metadata, starting from
/// `defaults`. The metadata map carries the policy under the "policy" key.
pub fn policy_from_metadata(
    metadata: Option<&BTreeMap<String, AilValue>>,
    defaults: &SandboxConfig,
) -> Result<SandboxConfig, CognitionError> {
    let Some(policy_value) = metadata.and_then(|m| m.get("policy")) else {
        return Ok(defaults.clone());
    };

    let partial: PartialPolicy =
        serde_json::from_value(policy_value.to_json()).map_err(|e| {
            CognitionError::Validation(format!("malformed sandbox policy: {e}"))
        })?;

    Ok(SandboxConfig {
        memory_limit_mb: partial.memory_limit_mb.unwrap_or(defaults.memory_limit_mb),
        cpu_limit_ms: partial.cpu_limit_ms.unwrap_or(defaults.cpu_limit_ms),
        network_access: partial.network_access.unwrap_or(defaults.network_access),
        file_access: partial.file_access.unwrap_or(defaults.file_access),
        allowed_operations: partial
            .allowed_operations
            .unwrap_or_else(|| defaults.allowed_operations.clone()),
    })
}

/// Check a tool's declared capabilities against the policy. An empty
/// allow-list denies every tool.
pub fn check_policy(
    policy: &SandboxConfig,
    tool: &str,
    capabilities: &ToolCapabilities,
) -> Result<(), CognitionError> {
    if !policy.allowed_operations.iter().any(|allowed| allowed == tool) {
        return Err(CognitionError::PolicyViolation(format!(
            "tool '{tool}' is not in the sandbox allow-list"
        )));
    }

    if capabilities.network_access && !policy.network_access {
        return Err(CognitionError::PolicyViolation(format!(
            "tool '{tool}' requires network access the policy does not grant"
        )));
    }

    if !policy.file_access.permits(capabilities.file_access) {
        return Err(CognitionError::PolicyViolation(format!(
            "tool '{tool}' requires file access beyond the policy"
        )));
    }

    if capabilities.memory_hint_mb > policy.memory_limit_mb {
        return Err(CognitionError::PolicyViolation(format!(
            "tool '{tool}' declares {} MiB, over the {} MiB limit",
            capabilities.memory_hint_mb, policy.memory_limit_mb
        )));
    }

    Ok(())
}
