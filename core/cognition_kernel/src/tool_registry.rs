//! Registry of in-process tools invocable by EXECUTE and SANDBOXED-EXECUTE.
//!
//! Handlers come in two flavors: cooperative handlers already yield to the
//! scheduler; blocking handlers are dispatched through `spawn_blocking`
//! behind a bounded semaphore so they cannot starve the runtime. Every
//! invocation runs under a timeout. Registration takes the write lock,
//! invocation the read lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ail_types::{CognitionError, ToolCapabilities};
use futures_util::future::BoxFuture;
use jsonschema::JSONSchema;
use platform::record_counter;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Outcome of a handler call before the registry wraps it.
pub type HandlerResult = Result<Value, String>;

/// A registered handler. Cooperative handlers return a future that yields;
/// blocking handlers are plain closures run on the worker pool.
#[derive(Clone)]
pub enum Handler {
    Cooperative(Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>),
    Blocking(Arc<dyn Fn(Value) -> HandlerResult + Send + Sync>),
}

impl Handler {
    /// Wrap an async closure as a cooperative handler.
    pub fn cooperative<F, Fut>(f: F) -> Handler
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Cooperative(Arc::new(move |params| Box::pin(f(params))))
    }

    /// Wrap a synchronous closure as a blocking handler.
    pub fn blocking<F>(f: F) -> Handler
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }
}

/// Everything declared about a tool at registration time.
#[derive(Clone, Debug)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    pub capabilities: ToolCapabilities,
    pub default_timeout_ms: u64,
    /// Optional JSON Schema validated against the parameter value before
    /// each invocation.
    pub params_schema: Option<Value>,
}

impl ToolRegistration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        ToolRegistration {
            name: name.into(),
            description: description.into(),
            capabilities: ToolCapabilities::default(),
            default_timeout_ms: 10_000,
            params_schema: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: ToolCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_params_schema(mut self, schema: Value) -> Self {
        self.params_schema = Some(schema);
        self
    }
}

struct RegisteredTool {
    registration: ToolRegistration,
    handler: Handler,
    compiled_schema: Option<JSONSchema>,
    /// Present for non-reentrant tools; serializes concurrent invocations.
    invoke_lock: Option<Mutex<()>>,
}

/// Name → handler mapping with invoke-with-timeout semantics.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
    blocking_permits: Arc<Semaphore>,
}

impl ToolRegistry {
    pub fn new(blocking_permits: usize) -> Self {
        ToolRegistry {
            tools: RwLock::new(HashMap::new()),
            blocking_permits: Arc::new(Semaphore::new(blocking_permits.max(1))),
        }
    }

    /// Register or replace a tool. Fails with `Validation` if the declared
    /// parameter schema does not compile.
    pub async fn register(
        &self,
        registration: ToolRegistration,
        handler: Handler,
    ) -> Result<(), CognitionError> {
        let compiled_schema = match &registration.params_schema {
            Some(schema) => Some(JSONSchema::compile(schema).map_err(|e| {
                CognitionError::Validation(format!(
                    "tool {} parameter schema is invalid: {e}",
                    registration.name
                ))
            })?),
            None => None,
        };

        let invoke_lock = if registration.capabilities.reentrant {
            None
        } else {
            Some(Mutex::new(()))
        };

        let name = registration.name.clone();
        let tool = Arc::new(RegisteredTool {
            registration,
            handler,
            compiled_schema,
            invoke_lock,
        });

        let mut tools = self.tools.write().await;
        tools.insert(name.clone(), tool);
        debug!(tool = %name, "tool registered");
        Ok(())
    }

    /// Remove a tool. Returns whether it was present.
    pub async fn remove(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Declared capabilities of a tool, if registered.
    pub async fn capabilities(&self, name: &str) -> Option<ToolCapabilities> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|t| t.registration.capabilities.clone())
    }

    pub async fn default_timeout_ms(&self, name: &str) -> Option<u64> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|t| t.registration.default_timeout_ms)
    }

    /// Registration records for every tool, sorted by name.
    pub async fn list(&self) -> Vec<ToolRegistration> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolRegistration> =
            tools.values().map(|t| t.registration.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Invoke a tool with the given parameter value and timeout.
    ///
    /// A timeout of zero fails immediately with `ToolTimeout`. Cooperative
    /// handlers are cancelled by dropping their future on timeout; blocking
    /// handlers cannot be interrupted, so their closure keeps the worker
    /// until it returns while the caller already observed the timeout.
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        timeout_ms: u64,
    ) -> Result<Value, CognitionError> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return Err(CognitionError::UnknownTool {
                tool: name.to_string(),
            });
        };

        record_counter("ail_tool_invocations_total", 1);

        if let Some(schema) = &tool.compiled_schema {
            if let Err(errors) = schema.validate(&params) {
                let details = errors
                    .map(|e| e.to_string())
                    .collect::<Vec<String>>()
                    .join("; ");
                return Err(CognitionError::ToolFailure {
                    tool: name.to_string(),
                    cause: format!("parameter validation failed: {details}"),
                });
            }
        }

        if timeout_ms == 0 {
            record_counter("ail_tool_timeouts_total", 1);
            return Err(CognitionError::ToolTimeout {
                tool: name.to_string(),
            });
        }

        let _guard = match &tool.invoke_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let duration = Duration::from_millis(timeout_ms);
        let outcome = match &tool.handler {
            Handler::Cooperative(f) => timeout(duration, f(params)).await,
            Handler::Blocking(f) => {
                let f = f.clone();
                let permits = self.blocking_permits.clone();
                timeout(duration, async move {
                    let _permit = permits.acquire_owned().await.map_err(|_| {
                        "blocking worker pool is shut down".to_string()
                    })?;
                    tokio::task::spawn_blocking(move || f(params))
                        .await
                        .map_err(|e| format!("blocking handler panicked: {e}"))?
                })
                .await
            }
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(CognitionError::ToolFailure {
                tool: name.to_string(),
                cause,
            }),
            Err(_) => {
                warn!(tool = %name, timeout_ms, "tool invocation timed out");
                record_counter("ail_tool_timeouts_total", 1);
                Err(CognitionError::ToolTimeout {
                    tool: name.to_string(),
                })
            }
        }
    }
}
