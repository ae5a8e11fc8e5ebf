//! The kernel facade: parse → validate → evaluate → log, plus the
//! administrative surface (tool registration, event firing, inspection,
//! shutdown). Collaborators are injected at construction; there is no
//! runtime discovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ail_types::{
    CognitionError, CognitionLogRecord, CognitionResult, SandboxConfig, EVENT_AGENT_ID,
    EVENT_PAYLOAD_BINDING,
};
use chrono::Utc;
use platform::{record_counter, record_histogram, with_execution_span, AuditLogger};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::builtin_tools;
use crate::canonical::to_canonical_text;
use crate::cognition_log::CognitionLog;
use crate::comms::{CommunicationSink, LocalSink};
use crate::config_service::KernelConfig;
use crate::evaluator::{evaluate, EvaluatorDeps, ExecContext};
use crate::events::{EventRegistration, EventRegistry};
use crate::memory::{EmbeddingProvider, HashEmbedder, InMemoryStore, MemoryStore};
use crate::parser::{parse_with_limits, ParserLimits};
use crate::scope::{Frame, StoredVariable, VariableStore};
use crate::tool_registry::{Handler, ToolRegistration, ToolRegistry};
use crate::validator::validate;

/// Per-call options for `execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overall deadline; falls back to the configured default.
    pub deadline_ms: Option<u64>,
    /// Sandbox defaults applied when SANDBOXED-EXECUTE carries no policy.
    pub sandbox_default: Option<SandboxConfig>,
}

pub struct CognitionKernel {
    config: KernelConfig,
    tools: Arc<ToolRegistry>,
    events: Arc<EventRegistry>,
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    sink: Arc<dyn CommunicationSink>,
    audit: AuditLogger,
    log: Arc<CognitionLog>,
    variable_store: Option<Arc<VariableStore>>,
    shutdown: AtomicBool,
}

impl CognitionKernel {
    /// Build a kernel with its collaborators. Installs telemetry, registers
    /// the built-in tools, and opens the durable log (and variable side
    /// table when configured).
    pub async fn new(
        config: KernelConfig,
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        sink: Arc<dyn CommunicationSink>,
    ) -> Result<Self, CognitionError> {
        platform::init_tracing("cognition_kernel")
            .map_err(|e| CognitionError::Internal(format!("tracing init failed: {e}")))?;
        if let Some(metrics) = &config.metrics {
            let bind_addr: std::net::SocketAddr = metrics.bind_addr.parse().map_err(|e| {
                CognitionError::Internal(format!(
                    "invalid metrics bind address '{}': {e}",
                    metrics.bind_addr
                ))
            })?;
            platform::init_metrics(bind_addr)
                .map_err(|e| CognitionError::Internal(format!("metrics init failed: {e}")))?;
        }

        let tools = ToolRegistry::new(config.blocking_pool_permits);
        let (registration, handler) = builtin_tools::shell_tool(config.shell_tool_timeout_ms);
        tools.register(registration, handler).await?;
        let (registration, handler) = builtin_tools::json_format_tool();
        tools.register(registration, handler).await?;

        let log = CognitionLog::open(&config.log_db_path)?;
        let variable_store = match &config.scope_db_path {
            Some(path) => Some(Arc::new(VariableStore::open(path)?)),
            None => None,
        };

        info!(
            log_db = %config.log_db_path,
            variable_store = config.scope_db_path.is_some(),
            "cognition kernel ready"
        );

        Ok(CognitionKernel {
            config,
            tools: Arc::new(tools),
            events: Arc::new(EventRegistry::new()),
            memory,
            embedder,
            sink,
            audit: AuditLogger::new(),
            log: Arc::new(log),
            variable_store,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Build a kernel over the in-process collaborators: a hash embedder of
    /// the configured dimension, a vector-scan store over it, and a local
    /// mailbox sink. Suited to tests and single-node deployments.
    pub async fn with_local_collaborators(config: KernelConfig) -> Result<Self, CognitionError> {
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HashEmbedder::new(config.embedding_dimension));
        let memory = Arc::new(InMemoryStore::new(embedder.clone()));
        let sink = Arc::new(LocalSink::new());
        Self::new(config, memory, embedder, sink).await
    }

    fn evaluator_deps(&self, sandbox_default: Option<SandboxConfig>) -> EvaluatorDeps {
        EvaluatorDeps {
            tools: self.tools.clone(),
            events: self.events.clone(),
            memory: self.memory.clone(),
            embedder: self.embedder.clone(),
            sink: self.sink.clone(),
            audit: self.audit.clone(),
            variable_store: self.variable_store.clone(),
            sandbox_defaults: sandbox_default
                .or_else(|| self.config.sandbox_defaults.clone())
                .unwrap_or_default(),
            config: self.config.clone(),
        }
    }

    /// Evaluate one cognition text for an agent. This is the single entry
    /// point front-ends call; it always returns a result and always appends
    /// exactly one cognition-log record.
    pub async fn execute(&self, cognition_text: &str, agent_id: &str) -> CognitionResult {
        self.execute_with_options(cognition_text, agent_id, ExecuteOptions::default())
            .await
    }

    pub async fn execute_with_options(
        &self,
        cognition_text: &str,
        agent_id: &str,
        options: ExecuteOptions,
    ) -> CognitionResult {
        self.execute_inner(cognition_text, agent_id, options, Vec::new())
            .await
    }

    async fn execute_inner(
        &self,
        cognition_text: &str,
        agent_id: &str,
        options: ExecuteOptions,
        root_bindings: Vec<(String, Value)>,
    ) -> CognitionResult {
        let started = Instant::now();
        let started_wall = Utc::now();
        record_counter("ail_executions_total", 1);

        if self.shutdown.load(Ordering::SeqCst) {
            record_counter("ail_execution_failures_total", 1);
            return CognitionResult::failed(
                CognitionError::Internal("kernel is shut down".to_string()),
                0,
            );
        }

        let limits = ParserLimits {
            max_depth: self.config.max_depth,
            max_tokens: self.config.max_tokens,
        };
        let parsed = parse_with_limits(cognition_text, limits)
            .and_then(|cognition| validate(&cognition).map(|_| cognition));

        let cognition = match parsed {
            Ok(cognition) => cognition,
            Err(error) => {
                warn!(agent_id, kind = error.kind(), "cognition rejected before evaluation");
                record_counter("ail_execution_failures_total", 1);
                let result =
                    CognitionResult::failed(error, started.elapsed().as_millis() as u64);
                self.append_log(
                    Uuid::new_v4(),
                    agent_id,
                    "INVALID",
                    cognition_text.to_string(),
                    &result,
                    started_wall,
                )
                .await;
                return result;
            }
        };

        let deadline = options
            .deadline_ms
            .or(self.config.default_deadline_ms)
            .map(|ms| started + Duration::from_millis(ms));
        let deps = self.evaluator_deps(options.sandbox_default);
        let mut ctx = ExecContext::new(agent_id.to_string(), cognition.cognition_id, deadline);

        let root_frame = Frame::root();
        for (name, value) in root_bindings {
            root_frame.set(&name, value);
        }

        let operation = cognition.operation;
        let root_id = cognition.cognition_id;
        let canonical_input = to_canonical_text(&cognition);

        let outcome = with_execution_span(root_id, operation.keyword(), async {
            evaluate(&deps, &mut ctx, root_frame, &cognition).await
        })
        .await;

        let execution_time_ms = started.elapsed().as_millis() as u64;
        record_histogram("ail_execution_seconds", started.elapsed().as_secs_f64());

        let mut result = match outcome {
            Ok(value) => CognitionResult::ok(value, execution_time_ms),
            Err(error) => {
                record_counter("ail_execution_failures_total", 1);
                CognitionResult::failed(error, execution_time_ms)
            }
        };
        result.causality_chain = ctx.chain.into_nodes();
        result
            .metadata
            .insert("agent_id".to_string(), Value::String(agent_id.to_string()));
        result.metadata.insert(
            "root_cognition_id".to_string(),
            Value::String(root_id.to_string()),
        );

        self.append_log(
            root_id,
            agent_id,
            operation.keyword(),
            canonical_input,
            &result,
            started_wall,
        )
        .await;

        // The side table only outlives the call for inspection of *live*
        // executions; completed roots are swept.
        if let Some(store) = &self.variable_store {
            store.clear_root(&root_id);
        }

        result
    }

    /// Append the durable log record. Failures are logged and counted but
    /// never change the user-visible result.
    async fn append_log(
        &self,
        cognition_id: Uuid,
        agent_id: &str,
        operation: &str,
        input_serialized: String,
        result: &CognitionResult,
        started_wall: chrono::DateTime<Utc>,
    ) {
        let result_serialized = serde_json::to_string(result)
            .unwrap_or_else(|e| format!("{{\"serialization_error\":\"{e}\"}}"));
        let causality_json = serde_json::to_string(&result.causality_chain)
            .unwrap_or_else(|_| "[]".to_string());

        let record = CognitionLogRecord {
            cognition_id,
            agent_id: agent_id.to_string(),
            operation: operation.to_string(),
            input_serialized,
            result_serialized,
            success: result.success,
            started_at: started_wall,
            finished_at: Utc::now(),
            parent_id: None,
            causality_json,
        };

        if let Err(error) = self.log.append(record).await {
            record_counter("ail_log_append_failures_total", 1);
            warn!(%cognition_id, "cognition log append failed: {error}");
            self.audit
                .log_event(platform::AuditEvent::new(
                    platform::AuditEventType::LogAppendFailure,
                    Some(agent_id.to_string()),
                    cognition_id.to_string(),
                    "append".to_string(),
                    "failed".to_string(),
                    None,
                ))
                .await;
        }
    }

    /// Register an external tool.
    pub async fn register_tool(
        &self,
        registration: ToolRegistration,
        handler: Handler,
    ) -> Result<(), CognitionError> {
        let name = registration.name.clone();
        self.tools.register(registration, handler).await?;
        self.audit.log_tool_registration(&name, false).await;
        Ok(())
    }

    /// Remove a tool. Returns whether it was registered.
    pub async fn remove_tool(&self, name: &str) -> bool {
        let removed = self.tools.remove(name).await;
        if removed {
            self.audit.log_tool_registration(name, true).await;
        }
        removed
    }

    /// Fire a registered event: its stored handler is evaluated as a fresh
    /// execute call under the synthetic `event` agent id, with the payload
    /// bound to `_event` in the root frame. Waiters suspended on the event
    /// are woken afterwards.
    pub async fn fire_event(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<CognitionResult, CognitionError> {
        let Some(registration) = self.events.get(name) else {
            return Err(CognitionError::Validation(format!(
                "event '{name}' is not registered"
            )));
        };

        self.audit
            .log_event(platform::AuditEvent::new(
                platform::AuditEventType::EventFired,
                None,
                name.to_string(),
                "fire".to_string(),
                "ok".to_string(),
                Some(payload.clone()),
            ))
            .await;

        let result = self
            .execute_inner(
                &registration.handler_text,
                EVENT_AGENT_ID,
                ExecuteOptions::default(),
                vec![(EVENT_PAYLOAD_BINDING.to_string(), payload)],
            )
            .await;

        self.events.signal(name);
        Ok(result)
    }

    /// Remove an event registration.
    pub async fn remove_event(&self, name: &str) -> bool {
        self.events.remove(name)
    }

    /// Refuse further executions. In-flight calls run to completion.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("cognition kernel shut down");
    }

    // Read-only inspection surface for reflection tooling.

    pub async fn list_tools(&self) -> Vec<ToolRegistration> {
        self.tools.list().await
    }

    pub fn list_events(&self) -> Vec<EventRegistration> {
        self.events.list()
    }

    pub async fn recent_log_entries(
        &self,
        limit: usize,
    ) -> Result<Vec<CognitionLogRecord>, CognitionError> {
        self.log.recent(limit).await
    }

    /// Persisted bindings of a live execution; empty once the root
    /// completes.
    pub fn inspect_variables(&self, root_cognition_id: &Uuid) -> Vec<StoredVariable> {
        self.variable_store
            .as_ref()
            .map(|store| store.snapshot(root_cognition_id))
            .unwrap_or_default()
    }

    pub async fn audit_events(&self) -> Vec<platform::AuditEvent> {
        self.audit.events().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::LocalSink;
    use crate::memory::{HashEmbedder, InMemoryStore};
    use serde_json::json;

    async fn test_kernel(dir: &tempfile::TempDir) -> CognitionKernel {
        let config = KernelConfig {
            log_db_path: dir
                .path()
                .join("log.db")
                .to_str()
                .expect("utf8 path")
                .to_string(),
            scope_db_path: Some(
                dir.path()
                    .join("scope")
                    .to_str()
                    .expect("utf8 path")
                    .to_string(),
            ),
            ..Default::default()
        };
        let embedder = Arc::new(HashEmbedder::new(32));
        let kernel = CognitionKernel::new(
            config,
            Arc::new(InMemoryStore::new(embedder.clone())),
            embedder,
            Arc::new(LocalSink::new()),
        )
        .await
        .expect("kernel should build");

        kernel
            .register_tool(
                ToolRegistration::new("kv", "echo"),
                Handler::cooperative(|params| async move { Ok(params) }),
            )
            .await
            .expect("register kv");
        kernel
    }

    #[tokio::test]
    async fn execute_appends_exactly_one_log_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;

        let result = kernel.execute(r#"(EXECUTE [kv] ["1"])"#, "agent-1").await;
        assert!(result.success);
        assert_eq!(result.value, json!("1"));
        assert_eq!(result.causality_chain.len(), 1);

        let records = kernel.recent_log_entries(10).await.expect("log read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "EXECUTE");
        assert_eq!(records[0].input_serialized, r#"(EXECUTE [kv] ["1"])"#);
        assert!(records[0].success);

        let second = kernel.execute(r#"(EXECUTE [kv] ["2"])"#, "agent-1").await;
        assert!(second.success);
        let records = kernel.recent_log_entries(10).await.expect("log read");
        assert_eq!(records.len(), 2, "one append per execute call");
    }

    #[tokio::test]
    async fn parse_failures_are_logged_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;

        let result = kernel.execute("(EXECUTE [kv]", "agent-1").await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some("parse"));

        let records = kernel.recent_log_entries(10).await.expect("log read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "INVALID");
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn variables_are_swept_after_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;

        let result = kernel
            .execute(
                r#"(LET ((x (EXECUTE [kv] ["42"]))) (EXECUTE [kv] [x]))"#,
                "agent-1",
            )
            .await;
        assert!(result.success);
        assert_eq!(result.value, json!("42"));

        let root_id = Uuid::parse_str(
            result.metadata["root_cognition_id"]
                .as_str()
                .expect("root id"),
        )
        .expect("uuid");
        assert!(kernel.inspect_variables(&root_id).is_empty());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;

        kernel.shutdown().await;
        let result = kernel.execute(r#"(EXECUTE [kv] ["1"])"#, "agent-1").await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some("internal"));
    }

    #[tokio::test]
    async fn fire_event_runs_handler_as_event_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;

        let result = kernel
            .execute(
                r#"(EVENT {"name": "tick", "trigger": "manual", "handler": (EXECUTE [kv] [_event])})"#,
                "agent-1",
            )
            .await;
        assert!(result.success);

        let fired = kernel
            .fire_event("tick", json!({"n": 7}))
            .await
            .expect("fire should succeed");
        assert!(fired.success);
        assert_eq!(fired.value, json!({"n": 7}));
        assert_eq!(fired.metadata["agent_id"], json!("event"));
    }

    #[tokio::test]
    async fn local_collaborators_build_from_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = KernelConfig {
            log_db_path: dir
                .path()
                .join("log.db")
                .to_str()
                .expect("utf8 path")
                .to_string(),
            embedding_dimension: 16,
            ..Default::default()
        };

        let kernel = CognitionKernel::with_local_collaborators(config)
            .await
            .expect("kernel should build");
        kernel
            .register_tool(
                ToolRegistration::new("kv", "echo"),
                Handler::cooperative(|params| async move { Ok(params) }),
            )
            .await
            .expect("register kv");

        let result = kernel.execute(r#"(EXECUTE [kv] ["ok"])"#, "agent-1").await;
        assert!(result.success);

        // QUERY drives the config-built embedder and store end to end.
        let query = kernel
            .execute(r#"(QUERY {"intent": "find anything"})"#, "agent-1")
            .await;
        assert!(query.success, "query should succeed: {:?}", query.error);
        assert_eq!(query.value["total"], json!(0));
    }

    #[tokio::test]
    async fn metrics_config_installs_exporter() {
        use crate::config_service::MetricsConfig;

        let dir = tempfile::tempdir().expect("tempdir");
        let config = KernelConfig {
            log_db_path: dir
                .path()
                .join("log.db")
                .to_str()
                .expect("utf8 path")
                .to_string(),
            // Port 0 picks any free port; a second install elsewhere in the
            // process is absorbed by the platform Once guard.
            metrics: Some(MetricsConfig {
                bind_addr: "127.0.0.1:0".to_string(),
            }),
            ..Default::default()
        };

        let kernel = CognitionKernel::with_local_collaborators(config)
            .await
            .expect("kernel with metrics should build");
        let result = kernel.execute(r#"(EXECUTE [json_format] [1])"#, "agent-1").await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn malformed_metrics_address_is_rejected() {
        use crate::config_service::MetricsConfig;

        let dir = tempfile::tempdir().expect("tempdir");
        let config = KernelConfig {
            log_db_path: dir
                .path()
                .join("log.db")
                .to_str()
                .expect("utf8 path")
                .to_string(),
            metrics: Some(MetricsConfig {
                bind_addr: "not-an-address".to_string(),
            }),
            ..Default::default()
        };

        let err = CognitionKernel::with_local_collaborators(config)
            .await
            .err()
            .expect("construction should fail");
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn fire_unknown_event_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;
        let err = kernel.fire_event("ghost", json!(null)).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn overall_deadline_returns_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = test_kernel(&dir).await;
        kernel
            .register_tool(
                ToolRegistration::new("sleepy", "sleeps").with_timeout_ms(60_000),
                Handler::cooperative(|_| async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!("late"))
                }),
            )
            .await
            .expect("register sleepy");

        let result = kernel
            .execute_with_options(
                r#"(EXECUTE [sleepy] [])"#,
                "agent-1",
                ExecuteOptions {
                    deadline_ms: Some(30),
                    ..Default::default()
                },
            )
            .await;
        assert!(!result.success);
        // The per-call timeout is clamped to the remaining deadline, so the
        // failure surfaces as a tool timeout at the EXECUTE node.
        let kind = result.error.as_ref().map(|e| e.kind());
        assert!(
            kind == Some("tool_timeout") || kind == Some("timeout"),
            "expected a timeout kind, got {kind:?}"
        );
    }
}
