//! Recursive evaluator for the eleven AIL operations.
//!
//! Evaluation is threaded through a mutable `ExecContext` carrying the
//! causality chain and the overall deadline. Every handler appends a
//! causality node on entry and completes it on exit, then returns the
//! operation's value shape. Within one execute call, reductions are
//! deterministic and left-to-right.

use std::sync::Arc;
use std::time::Instant;

use ail_types::{
    AilValue, Cognition, CognitionError, CognitionId, Operation, QueryMode, SandboxConfig,
    ERROR_BINDING,
};
use chrono::Utc;
use futures_util::future::BoxFuture;
use platform::{record_counter, AuditEvent, AuditEventType, AuditLogger};
use serde_json::{json, Value};
use tracing::debug;

use crate::canonical;
use crate::causality::CausalityChain;
use crate::comms::CommunicationSink;
use crate::config_service::KernelConfig;
use crate::events::{EventRegistration, EventRegistry};
use crate::memory::{EmbeddingProvider, MemoryStore};
use crate::planner;
use crate::sandbox;
use crate::scope::{Frame, VariableStore};
use crate::tool_registry::ToolRegistry;

/// AWAIT timeout when neither metadata nor a deadline bounds the wait.
const DEFAULT_AWAIT_TIMEOUT_MS: u64 = 30_000;

/// Shared kernel internals the evaluator reduces against.
pub struct EvaluatorDeps {
    pub tools: Arc<ToolRegistry>,
    pub events: Arc<EventRegistry>,
    pub memory: Arc<dyn MemoryStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub sink: Arc<dyn CommunicationSink>,
    pub audit: AuditLogger,
    pub variable_store: Option<Arc<VariableStore>>,
    pub config: KernelConfig,
    pub sandbox_defaults: SandboxConfig,
}

/// Mutable state of one execute call.
pub struct ExecContext {
    pub agent_id: String,
    pub root_cognition_id: CognitionId,
    pub deadline: Option<Instant>,
    pub chain: CausalityChain,
}

impl ExecContext {
    pub fn new(agent_id: String, root_cognition_id: CognitionId, deadline: Option<Instant>) -> Self {
        ExecContext {
            agent_id,
            root_cognition_id,
            deadline,
            chain: CausalityChain::new(),
        }
    }

    fn remaining_ms(&self) -> Option<u64> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_millis() as u64)
    }

    fn check_deadline(&self) -> Result<(), CognitionError> {
        match self.remaining_ms() {
            Some(0) => Err(CognitionError::Timeout(
                "overall execution deadline expired".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Clamp a per-call timeout to the remaining deadline. The deadline was
    /// checked non-zero just before, so the clamp never reaches zero.
    fn clamp_timeout(&self, timeout_ms: u64) -> u64 {
        match self.remaining_ms() {
            Some(remaining) => timeout_ms.min(remaining.max(1)),
            None => timeout_ms,
        }
    }
}

/// Evaluate one cognition in `frame`, recording it in the causality chain.
pub fn evaluate<'a>(
    deps: &'a EvaluatorDeps,
    ctx: &'a mut ExecContext,
    frame: Arc<Frame>,
    cognition: &'a Cognition,
) -> BoxFuture<'a, Result<Value, CognitionError>> {
    Box::pin(async move {
        ctx.check_deadline()?;
        let index = ctx.chain.begin(cognition);

        let result = match cognition.operation {
            Operation::Query => eval_query(deps, cognition).await,
            Operation::Execute => eval_execute(deps, ctx, frame, cognition).await,
            Operation::Plan => eval_plan(deps, ctx, frame, cognition).await,
            Operation::Communicate => eval_communicate(deps, ctx, cognition).await,
            Operation::Let => eval_let(deps, ctx, frame, cognition).await,
            Operation::Try => eval_try(deps, ctx, frame, cognition).await,
            Operation::Await => eval_await(deps, ctx, frame, cognition).await,
            Operation::SandboxedExecute => eval_sandboxed_execute(deps, ctx, frame, cognition).await,
            Operation::Clarify => eval_clarify(cognition),
            Operation::Event => eval_event(deps, ctx, cognition).await,
            Operation::OnFail => Err(CognitionError::Internal(
                "ON-FAIL marker reached the evaluator".to_string(),
            )),
        };

        ctx.chain.finish(index, result.is_ok());
        result
    })
}

/// Reduce an argument value to JSON: child cognitions are evaluated,
/// payload-less entities resolve through the scope chain. An unbound name
/// inside a LET body (scope level > 0) is an error; at the root it passes
/// through as an opaque entity.
fn resolve_value<'a>(
    deps: &'a EvaluatorDeps,
    ctx: &'a mut ExecContext,
    frame: Arc<Frame>,
    value: &'a AilValue,
) -> BoxFuture<'a, Result<Value, CognitionError>> {
    Box::pin(async move {
        match value {
            AilValue::Cognition(child) => evaluate(deps, ctx, frame, child).await,
            AilValue::Entity(entity) if entity.payload.is_none() => {
                match frame.get(&entity.name) {
                    Some(bound) => Ok(bound),
                    None if frame.scope_level() > 0 => Err(CognitionError::UnboundVariable {
                        name: entity.name.clone(),
                    }),
                    None => Ok(value.to_json()),
                }
            }
            AilValue::Entity(entity) => {
                let payload = entity.payload.as_deref().map(|p| p.to_json());
                Ok(json!({ "entity": entity.name, "payload": payload }))
            }
            AilValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_value(deps, ctx, frame.clone(), item).await?);
                }
                Ok(Value::Array(out))
            }
            AilValue::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), resolve_value(deps, ctx, frame.clone(), item).await?);
                }
                Ok(Value::Object(out))
            }
            literal => Ok(literal.to_json()),
        }
    })
}

/// Tool parameters: a single-element array collapses to its element, so
/// `(EXECUTE [kv] ["42"])` hands the tool the string `"42"`.
async fn resolve_params(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    raw: &AilValue,
) -> Result<Value, CognitionError> {
    let value = resolve_value(deps, ctx, frame, raw).await?;
    Ok(match value {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    })
}

fn shape_error(operation: Operation, what: &str) -> CognitionError {
    CognitionError::Internal(format!("{operation} arg shape broke after validation: {what}"))
}

async fn eval_query(deps: &EvaluatorDeps, cognition: &Cognition) -> Result<Value, CognitionError> {
    let map = cognition.args[0]
        .as_map()
        .ok_or_else(|| shape_error(Operation::Query, "metadata map"))?;
    let intent = map
        .get("intent")
        .and_then(AilValue::as_str)
        .ok_or_else(|| shape_error(Operation::Query, "intent"))?;
    let mode = map
        .get("mode")
        .and_then(AilValue::as_str)
        .and_then(QueryMode::from_str)
        .unwrap_or(QueryMode::Standard);
    let max_results = map
        .get("max_results")
        .and_then(AilValue::as_f64)
        .map(|n| n.max(1.0) as usize)
        .unwrap_or(deps.config.query_max_results);
    let threshold = map
        .get("similarity_threshold")
        .and_then(AilValue::as_f64)
        .map(|n| n as f32);

    let plan = planner::build_plan(intent, mode);
    let execution =
        planner::execute_plan(&plan, &deps.memory, &deps.embedder, max_results, threshold).await?;

    let memories = execution
        .memories
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<Value>, _>>()
        .map_err(|e| CognitionError::Internal(format!("memory record serialization: {e}")))?;

    let mut value = json!({
        "mode": mode.as_str(),
        "intent": intent,
        "memories": memories,
        "total": execution.memories.len(),
        "plan_id": plan.plan_id,
        "confidence": plan.confidence,
    });
    if let Some(object) = value.as_object_mut() {
        for (key, artifact) in execution.artifacts {
            object.insert(key, artifact);
        }
    }
    Ok(value)
}

async fn eval_execute(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let entity = cognition.args[0]
        .as_entity()
        .ok_or_else(|| shape_error(Operation::Execute, "tool entity"))?;
    let tool = entity.name.clone();

    let params = resolve_params(deps, ctx, frame, &cognition.args[1]).await?;

    let timeout_ms = deps
        .tools
        .default_timeout_ms(&tool)
        .await
        .unwrap_or(deps.config.default_tool_timeout_ms);
    let timeout_ms = ctx.clamp_timeout(timeout_ms);

    debug!(tool = %tool, timeout_ms, "invoking tool");
    deps.tools.invoke(&tool, params, timeout_ms).await
}

async fn eval_plan(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let goal = cognition.args[0]
        .as_map()
        .and_then(|m| m.get("goal"))
        .and_then(AilValue::as_str)
        .ok_or_else(|| shape_error(Operation::Plan, "goal"))?
        .to_string();

    let mut stages = Vec::new();
    for child_value in &cognition.args[1..] {
        let child = child_value
            .as_cognition()
            .ok_or_else(|| shape_error(Operation::Plan, "child cognition"))?;

        match evaluate(deps, ctx, frame.clone(), child).await {
            Ok(value) => stages.push(json!({ "success": true, "value": value })),
            Err(error) if !error.is_recoverable() => return Err(error),
            // A failed TRY already spent its recovery; record it and move
            // on instead of short-circuiting the whole plan.
            Err(error) if child.operation == Operation::Try => {
                stages.push(json!({
                    "success": false,
                    "error": { "kind": error.kind(), "message": error.to_string() },
                }));
            }
            Err(error) => return Err(error),
        }
    }

    Ok(json!({ "goal": goal, "stages": stages }))
}

async fn eval_communicate(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let recipient = cognition.args[0]
        .as_entity()
        .ok_or_else(|| shape_error(Operation::Communicate, "recipient entity"))?
        .name
        .clone();
    let inner = cognition.args[1]
        .as_cognition()
        .ok_or_else(|| shape_error(Operation::Communicate, "inner cognition"))?;

    let message = canonical::to_canonical_text(inner);

    match deps
        .sink
        .deliver(recipient, message, ctx.agent_id.clone())
        .await
    {
        Ok(receipt) => Ok(json!({
            "delivered": true,
            "message_id": receipt.message_id,
            "recipient": receipt.recipient,
            "delivered_at": receipt.delivered_at,
        })),
        Err(cause) => Err(CognitionError::ToolFailure {
            tool: "communicate".to_string(),
            cause,
        }),
    }
}

async fn eval_let(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let bindings = cognition.args[0]
        .as_array()
        .ok_or_else(|| shape_error(Operation::Let, "binding list"))?;

    // The frame lives for exactly this function's extent; every return path
    // drops it, so bindings cannot escape.
    let child_frame = Frame::child(&frame);

    for pair in bindings {
        let parts = pair
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| shape_error(Operation::Let, "binding pair"))?;
        let name = parts[0]
            .as_str()
            .ok_or_else(|| shape_error(Operation::Let, "binding name"))?;
        let bound = parts[1]
            .as_cognition()
            .ok_or_else(|| shape_error(Operation::Let, "bound cognition"))?;

        let value = evaluate(deps, ctx, child_frame.clone(), bound).await?;
        child_frame.set(name, value.clone());
        child_frame.record_result(bound.cognition_id);

        if let Some(store) = &deps.variable_store {
            store.persist(&ctx.root_cognition_id, child_frame.scope_level(), name, &value);
        }
    }

    let body = cognition.args[1]
        .as_cognition()
        .ok_or_else(|| shape_error(Operation::Let, "body cognition"))?;
    evaluate(deps, ctx, child_frame, body).await
}

async fn eval_try(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let attempt = cognition.args[0]
        .as_cognition()
        .ok_or_else(|| shape_error(Operation::Try, "attempt"))?;
    let recovery = cognition.args[2]
        .as_cognition()
        .ok_or_else(|| shape_error(Operation::Try, "recovery"))?;

    match evaluate(deps, ctx, frame.clone(), attempt).await {
        Ok(value) => Ok(value),
        Err(error) if !error.is_recoverable() => Err(error),
        Err(error) => {
            debug!(kind = error.kind(), "TRY attempt failed, running recovery");
            let recovery_frame = Frame::child(&frame);
            recovery_frame.set(
                ERROR_BINDING,
                json!({ "kind": error.kind(), "message": error.to_string() }),
            );
            evaluate(deps, ctx, recovery_frame, recovery).await
        }
    }
}

async fn eval_await(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let inner = cognition.args[0]
        .as_cognition()
        .ok_or_else(|| shape_error(Operation::Await, "inner cognition"))?;
    let timeout_ms = cognition
        .args
        .get(1)
        .and_then(AilValue::as_map)
        .and_then(|m| m.get("timeout_ms"))
        .and_then(AilValue::as_f64)
        .map(|n| n.max(0.0) as u64);

    let inner_value = evaluate(deps, ctx, frame, inner).await?;

    // Values that are not pending event handles are already complete.
    let pending_event = inner_value
        .get("event")
        .and_then(Value::as_str)
        .filter(|_| inner_value.get("status").and_then(Value::as_str) == Some("registered"))
        .map(str::to_string);
    let Some(event_name) = pending_event else {
        return Ok(inner_value);
    };

    let timeout_ms = timeout_ms.unwrap_or_else(|| {
        ctx.remaining_ms().unwrap_or(DEFAULT_AWAIT_TIMEOUT_MS)
    });
    if timeout_ms == 0 {
        return Err(CognitionError::Timeout(format!(
            "AWAIT on '{event_name}' timed out after 0 ms"
        )));
    }

    let Some(notify) = deps.events.notifier(&event_name) else {
        return Ok(inner_value);
    };

    let wait = ctx.clamp_timeout(timeout_ms);
    match tokio::time::timeout(std::time::Duration::from_millis(wait), notify.notified()).await {
        Ok(()) => Ok(json!({ "event": event_name, "status": "fired" })),
        Err(_) => Err(CognitionError::Timeout(format!(
            "AWAIT on '{event_name}' timed out after {timeout_ms} ms"
        ))),
    }
}

async fn eval_sandboxed_execute(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    frame: Arc<Frame>,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let entity = cognition.args[0]
        .as_entity()
        .ok_or_else(|| shape_error(Operation::SandboxedExecute, "tool entity"))?;
    let tool = entity.name.clone();
    let metadata = cognition.args.get(2).and_then(AilValue::as_map);

    let policy = sandbox::policy_from_metadata(metadata, &deps.sandbox_defaults)?;

    let check = match deps.tools.capabilities(&tool).await {
        Some(capabilities) => sandbox::check_policy(&policy, &tool, &capabilities),
        // Policy comes first: a tool outside the allow-list is denied
        // whether or not it exists.
        None if !policy.allowed_operations.iter().any(|t| t == &tool) => {
            Err(CognitionError::PolicyViolation(format!(
                "tool '{tool}' is not in the sandbox allow-list"
            )))
        }
        None => Err(CognitionError::UnknownTool { tool: tool.clone() }),
    };

    if let Err(error) = check {
        if matches!(error, CognitionError::PolicyViolation(_)) {
            record_counter("ail_policy_denials_total", 1);
            deps.audit
                .log_policy_denial(Some(ctx.agent_id.clone()), &tool, &error.to_string())
                .await;
        }
        return Err(error);
    }

    let params = resolve_params(deps, ctx, frame, &cognition.args[1]).await?;
    let timeout_ms = ctx.clamp_timeout(policy.cpu_limit_ms as u64);
    deps.tools.invoke(&tool, params, timeout_ms).await
}

fn eval_clarify(cognition: &Cognition) -> Result<Value, CognitionError> {
    let map = cognition.args[0]
        .as_map()
        .ok_or_else(|| shape_error(Operation::Clarify, "metadata map"))?;

    Ok(json!({
        "ambiguous_intent": map.get("ambiguous_intent").map(AilValue::to_json),
        "clarification_prompt": map.get("clarification_prompt").map(AilValue::to_json),
        "options": map
            .get("options")
            .map(AilValue::to_json)
            .unwrap_or_else(|| json!([])),
        "status": "awaiting_clarification",
    }))
}

async fn eval_event(
    deps: &EvaluatorDeps,
    ctx: &mut ExecContext,
    cognition: &Cognition,
) -> Result<Value, CognitionError> {
    let map = cognition.args[0]
        .as_map()
        .ok_or_else(|| shape_error(Operation::Event, "metadata map"))?;
    let name = map
        .get("name")
        .and_then(AilValue::as_str)
        .ok_or_else(|| shape_error(Operation::Event, "name"))?
        .to_string();
    let trigger = map
        .get("trigger")
        .and_then(AilValue::as_str)
        .ok_or_else(|| shape_error(Operation::Event, "trigger"))?
        .to_string();
    let description = map
        .get("description")
        .and_then(AilValue::as_str)
        .map(str::to_string);
    let handler = map
        .get("handler")
        .and_then(AilValue::as_cognition)
        .ok_or_else(|| shape_error(Operation::Event, "handler"))?;

    // Handlers are stored by value as canonical text, never as pointers
    // into this tree.
    let registration = EventRegistration {
        name: name.clone(),
        trigger: trigger.clone(),
        description,
        handler_text: canonical::to_canonical_text(handler),
        registered_at: Utc::now(),
    };
    deps.events.register(registration);

    deps.audit
        .log_event(AuditEvent::new(
            AuditEventType::EventRegistered,
            Some(ctx.agent_id.clone()),
            name.clone(),
            "register".to_string(),
            "ok".to_string(),
            None,
        ))
        .await;

    Ok(json!({ "event": name, "status": "registered", "trigger": trigger }))
}
