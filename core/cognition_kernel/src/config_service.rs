//! Kernel configuration: TOML files with environment interpolation and a
//! base + environment-overlay merge.

use ail_types::SandboxConfig;
use once_cell::sync::Lazy;
use platform::PlatformError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

fn default_max_depth() -> usize {
    ail_types::DEFAULT_MAX_DEPTH
}

fn default_max_tokens() -> usize {
    ail_types::DEFAULT_MAX_TOKENS
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

fn default_shell_timeout_ms() -> u64 {
    crate::builtin_tools::SHELL_DEFAULT_TIMEOUT_MS
}

fn default_blocking_permits() -> usize {
    16
}

fn default_query_max_results() -> usize {
    10
}

fn default_log_db_path() -> String {
    "ail_cognitions.db".to_string()
}

fn default_embedding_dimension() -> usize {
    crate::memory::DEFAULT_EMBEDDING_DIM
}

/// Prometheus exporter settings, installed at kernel construction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Bind address for the `/metrics` endpoint, e.g. "127.0.0.1:9090".
    pub bind_addr: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KernelConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Per-call timeout applied when a tool declares none of its own.
    #[serde(default = "default_tool_timeout_ms")]
    pub default_tool_timeout_ms: u64,

    /// Timeout for the built-in shell tool.
    #[serde(default = "default_shell_timeout_ms")]
    pub shell_tool_timeout_ms: u64,

    /// Concurrency cap for blocking tool handlers.
    #[serde(default = "default_blocking_permits")]
    pub blocking_pool_permits: usize,

    #[serde(default = "default_query_max_results")]
    pub query_max_results: usize,

    #[serde(default = "default_log_db_path")]
    pub log_db_path: String,

    /// Durable variable side table; disabled when unset.
    #[serde(default)]
    pub scope_db_path: Option<String>,

    /// Dimension of the default hash embedder built by
    /// `CognitionKernel::with_local_collaborators`. Must agree with the
    /// memory store; the kernel never validates it for injected embedders.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    /// Overall execute deadline applied when the caller passes none.
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,

    /// Prometheus exporter; disabled when unset.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub sandbox_defaults: Option<SandboxConfig>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_depth: default_max_depth(),
            max_tokens: default_max_tokens(),
            default_tool_timeout_ms: default_tool_timeout_ms(),
            shell_tool_timeout_ms: default_shell_timeout_ms(),
            blocking_pool_permits: default_blocking_permits(),
            query_max_results: default_query_max_results(),
            log_db_path: default_log_db_path(),
            scope_db_path: None,
            embedding_dimension: default_embedding_dimension(),
            default_deadline_ms: None,
            metrics: None,
            sandbox_defaults: None,
        }
    }
}

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\{\{|\$\{)([a-zA-Z0-9_]+)(\}\}|\})").expect("env interpolation pattern")
});

/// Load a single TOML config file, interpolating `{{VAR}}` or `${VAR}` from
/// the environment. Unset variables are left in place so the TOML error
/// points at them.
pub fn load_single_config(path: &str) -> Result<KernelConfig, PlatformError> {
    let content = fs::read_to_string(path)
        .map_err(|e| PlatformError::Config(format!("failed to read config file {path}: {e}")))?;

    let processed = ENV_VAR_PATTERN.replace_all(&content, |caps: &regex::Captures| {
        let var_name = &caps[2];
        env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    });

    toml::from_str(&processed)
        .map_err(|e| PlatformError::Config(format!("failed to parse config file {path}: {e}")))
}

/// Load a base config plus an optional environment overlay. `.env` files
/// are honored before interpolation.
pub fn load_config(base_path: &str, overlay_path: Option<&str>) -> Result<KernelConfig, PlatformError> {
    dotenvy::dotenv().ok();

    let base = load_single_config(base_path)?;
    match overlay_path {
        Some(path) => Ok(merge_kernel_config(base, load_single_config(path)?)),
        None => Ok(base),
    }
}

/// Merge two configs, treating `overlay` as environment-specific overrides
/// on top of `base`. Scalar fields in the overlay win when they differ from
/// the serde defaults; optional sections win when present.
pub fn merge_kernel_config(base: KernelConfig, overlay: KernelConfig) -> KernelConfig {
    macro_rules! pick {
        ($field:ident, $default:expr) => {
            if overlay.$field != $default {
                overlay.$field
            } else {
                base.$field
            }
        };
    }

    KernelConfig {
        max_depth: pick!(max_depth, default_max_depth()),
        max_tokens: pick!(max_tokens, default_max_tokens()),
        default_tool_timeout_ms: pick!(default_tool_timeout_ms, default_tool_timeout_ms()),
        shell_tool_timeout_ms: pick!(shell_tool_timeout_ms, default_shell_timeout_ms()),
        blocking_pool_permits: pick!(blocking_pool_permits, default_blocking_permits()),
        query_max_results: pick!(query_max_results, default_query_max_results()),
        log_db_path: pick!(log_db_path, default_log_db_path()),
        scope_db_path: overlay.scope_db_path.or(base.scope_db_path),
        embedding_dimension: pick!(embedding_dimension, default_embedding_dimension()),
        default_deadline_ms: overlay.default_deadline_ms.or(base.default_deadline_ms),
        metrics: overlay.metrics.or(base.metrics),
        sandbox_defaults: overlay.sandbox_defaults.or(base.sandbox_defaults),
    }
}
