use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// Query-plan types produced by the planner for QUERY cognitions.
pub mod plan;
pub use plan::*;

/// Identifier types shared across the kernel, planner, and log.
pub type CognitionId = Uuid;
pub type PlanId = Uuid;

/// Logical identifier for the agent submitting a cognition (e.g. "researcher-1").
/// Event-triggered executions use the synthetic id "event".
pub type AgentId = String;

/// Default parser security bounds.
pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MAX_TOKENS: usize = 1000;

/// Agent id used for executions triggered through `fire_event`.
pub const EVENT_AGENT_ID: &str = "event";

/// Well-known binding name for the caught error inside a TRY recovery frame.
pub const ERROR_BINDING: &str = "_error";

/// Well-known binding name for the payload of a fired event.
pub const EVENT_PAYLOAD_BINDING: &str = "_event";

/// The eleven reserved AIL operations.
///
/// Keyword spelling is part of the wire format and is case-sensitive;
/// `ON-FAIL` and `SANDBOXED-EXECUTE` are single tokens containing hyphens.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    #[serde(rename = "QUERY")]
    Query,
    #[serde(rename = "EXECUTE")]
    Execute,
    #[serde(rename = "PLAN")]
    Plan,
    #[serde(rename = "COMMUNICATE")]
    Communicate,
    #[serde(rename = "LET")]
    Let,
    #[serde(rename = "TRY")]
    Try,
    #[serde(rename = "ON-FAIL")]
    OnFail,
    #[serde(rename = "AWAIT")]
    Await,
    #[serde(rename = "SANDBOXED-EXECUTE")]
    SandboxedExecute,
    #[serde(rename = "CLARIFY")]
    Clarify,
    #[serde(rename = "EVENT")]
    Event,
}

impl Operation {
    pub const ALL: [Operation; 11] = [
        Operation::Query,
        Operation::Execute,
        Operation::Plan,
        Operation::Communicate,
        Operation::Let,
        Operation::Try,
        Operation::OnFail,
        Operation::Await,
        Operation::SandboxedExecute,
        Operation::Clarify,
        Operation::Event,
    ];

    /// The exact surface keyword for this operation.
    pub fn keyword(&self) -> &'static str {
        match self {
            Operation::Query => "QUERY",
            Operation::Execute => "EXECUTE",
            Operation::Plan => "PLAN",
            Operation::Communicate => "COMMUNICATE",
            Operation::Let => "LET",
            Operation::Try => "TRY",
            Operation::OnFail => "ON-FAIL",
            Operation::Await => "AWAIT",
            Operation::SandboxedExecute => "SANDBOXED-EXECUTE",
            Operation::Clarify => "CLARIFY",
            Operation::Event => "EVENT",
        }
    }

    /// Resolve a surface keyword. Case-sensitive by contract.
    pub fn from_keyword(keyword: &str) -> Option<Operation> {
        Operation::ALL.iter().copied().find(|op| op.keyword() == keyword)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// An opaque named reference: `[name]` or `[name:payload]`.
///
/// Entities name tools, agents, memory records, or (payload-less, inside a
/// LET body) scoped variables. Equality is by name plus structural payload
/// equality.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<AilValue>>,
}

impl Entity {
    pub fn named(name: impl Into<String>) -> Self {
        Entity {
            name: name.into(),
            payload: None,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: AilValue) -> Self {
        Entity {
            name: name.into(),
            payload: Some(Box::new(payload)),
        }
    }
}

/// A value position in the cognition tree: child cognition, entity, literal,
/// ordered list, or metadata map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AilValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<AilValue>),
    Map(BTreeMap<String, AilValue>),
    Entity(Entity),
    Cognition(Box<Cognition>),
}

impl AilValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AilValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AilValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AilValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AilValue>> {
        match self {
            AilValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AilValue]> {
        match self {
            AilValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            AilValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_cognition(&self) -> Option<&Cognition> {
        match self {
            AilValue::Cognition(c) => Some(c),
            _ => None,
        }
    }

    /// Lossy projection into JSON for tool parameters and result payloads.
    /// Unresolved entities become `{"entity": name, "payload": ...}` objects;
    /// embedded cognitions become their canonical description.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AilValue::Null => serde_json::Value::Null,
            AilValue::Bool(b) => serde_json::Value::Bool(*b),
            AilValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AilValue::String(s) => serde_json::Value::String(s.clone()),
            AilValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(AilValue::to_json).collect())
            }
            AilValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            AilValue::Entity(e) => {
                let mut obj = serde_json::Map::new();
                obj.insert("entity".into(), serde_json::Value::String(e.name.clone()));
                if let Some(payload) = &e.payload {
                    obj.insert("payload".into(), payload.to_json());
                }
                serde_json::Value::Object(obj)
            }
            AilValue::Cognition(c) => serde_json::json!({
                "cognition": c.operation.keyword(),
                "cognition_id": c.cognition_id,
            }),
        }
    }
}

/// One node of the AIL tree: one unit of intent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Cognition {
    /// Fresh UUID assigned at parse time. Immutable.
    pub cognition_id: CognitionId,

    /// UUID of the enclosing cognition in the parse tree, if any.
    #[serde(default)]
    pub parent_id: Option<CognitionId>,

    pub operation: Operation,

    /// Ordered argument values.
    pub args: Vec<AilValue>,

    /// Free-form metadata attached to the node. Sorted keys keep the
    /// canonical serialization stable.
    #[serde(default)]
    pub metadata: BTreeMap<String, AilValue>,
}

impl Cognition {
    /// Number of nodes in this subtree, counting this node.
    pub fn node_count(&self) -> usize {
        fn count_value(v: &AilValue) -> usize {
            match v {
                AilValue::Cognition(c) => c.node_count(),
                AilValue::Array(items) => items.iter().map(count_value).sum(),
                AilValue::Map(map) => map.values().map(count_value).sum(),
                _ => 0,
            }
        }
        1 + self.args.iter().map(count_value).sum::<usize>()
            + self.metadata.values().map(count_value).sum::<usize>()
    }
}

/// Exhaustive failure taxonomy. Every kernel failure maps to exactly one
/// variant; `is_recoverable` decides whether an enclosing TRY may catch it.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CognitionError {
    /// Ill-formed input text. Not recoverable.
    #[error("parse error: {0}")]
    Parse(String),

    /// Depth/token bound exceeded. Not recoverable.
    #[error("security violation: {0}")]
    Security(String),

    /// Shape/arity mismatch, or unknown query mode. Not recoverable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// EXECUTE named a tool absent from the registry.
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    /// A registered tool returned an error.
    #[error("tool {tool} failed: {cause}")]
    ToolFailure { tool: String, cause: String },

    /// A tool did not complete within its timeout.
    #[error("tool {tool} timed out")]
    ToolTimeout { tool: String },

    /// AWAIT or the overall deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Sandbox policy denied an invocation pre-flight. Not recoverable.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// External memory store call failed.
    #[error("memory store error: {0}")]
    MemoryStore(String),

    /// A LET body referenced a name not in scope.
    #[error("unbound variable: {name}")]
    UnboundVariable { name: String },

    /// Implementation bug or broken invariant. Not recoverable, always
    /// logged with a full causality snapshot.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CognitionError {
    /// Whether the nearest enclosing TRY may catch this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CognitionError::Parse(_)
                | CognitionError::Security(_)
                | CognitionError::Validation(_)
                | CognitionError::PolicyViolation(_)
                | CognitionError::Internal(_)
        )
    }

    /// Stable snake_case name of the variant, for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            CognitionError::Parse(_) => "parse",
            CognitionError::Security(_) => "security",
            CognitionError::Validation(_) => "validation",
            CognitionError::UnknownTool { .. } => "unknown_tool",
            CognitionError::ToolFailure { .. } => "tool_failure",
            CognitionError::ToolTimeout { .. } => "tool_timeout",
            CognitionError::Timeout(_) => "timeout",
            CognitionError::PolicyViolation(_) => "policy_violation",
            CognitionError::MemoryStore(_) => "memory_store",
            CognitionError::UnboundVariable { .. } => "unbound_variable",
            CognitionError::Internal(_) => "internal",
        }
    }
}

/// One node of the causality chain recorded while evaluating a cognition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CausalityNode {
    pub cognition_id: CognitionId,
    #[serde(default)]
    pub parent_id: Option<CognitionId>,
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: Option<bool>,
    /// Reserved for drive/motivation attribution; empty today.
    #[serde(default)]
    pub drive_influences: Vec<String>,
}

/// Result of one `execute` call or one evaluated sub-cognition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CognitionResult {
    pub success: bool,
    pub value: serde_json::Value,
    #[serde(default)]
    pub error: Option<CognitionError>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub causality_chain: Vec<CausalityNode>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CognitionResult {
    pub fn ok(value: serde_json::Value, execution_time_ms: u64) -> Self {
        CognitionResult {
            success: true,
            value,
            error: None,
            execution_time_ms,
            causality_chain: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn failed(error: CognitionError, execution_time_ms: u64) -> Self {
        CognitionResult {
            success: false,
            value: serde_json::Value::Null,
            error: Some(error),
            execution_time_ms,
            causality_chain: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// File-system access levels a sandbox policy may grant.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileAccess {
    None,
    Read,
    ReadWrite,
}

impl FileAccess {
    /// Whether a policy granting `self` covers a tool requiring `required`.
    pub fn permits(&self, required: FileAccess) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            FileAccess::None => 0,
            FileAccess::Read => 1,
            FileAccess::ReadWrite => 2,
        }
    }
}

/// Declarative sandbox constraints for SANDBOXED-EXECUTE.
///
/// Enforcement is pre-flight and advisory: the evaluator refuses tools whose
/// declared capabilities exceed the policy and passes `cpu_limit_ms` as the
/// invocation timeout. This is a policy contract, not an OS sandbox.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub memory_limit_mb: u32,
    pub cpu_limit_ms: u32,
    pub network_access: bool,
    pub file_access: FileAccess,
    /// Tools that may be invoked under this policy. Empty means deny-all.
    pub allowed_operations: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            memory_limit_mb: 64,
            cpu_limit_ms: 1000,
            network_access: false,
            file_access: FileAccess::None,
            allowed_operations: Vec::new(),
        }
    }
}

/// Capability descriptor declared at tool registration and consulted by the
/// sandbox policy checks and the dispatcher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCapabilities {
    /// Blocking handlers are dispatched through the worker pool.
    pub blocking: bool,
    /// Non-reentrant handlers are serialized per tool.
    pub reentrant: bool,
    pub network_access: bool,
    pub file_access: FileAccess,
    pub memory_hint_mb: u32,
}

impl Default for ToolCapabilities {
    fn default() -> Self {
        ToolCapabilities {
            blocking: false,
            reentrant: true,
            network_access: false,
            file_access: FileAccess::None,
            memory_hint_mb: 16,
        }
    }
}

/// Memory record classes held by the external store.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
        }
    }
}

/// A record returned by the memory store. `similarity_score` is populated
/// only by retrieval.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub content: String,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub similarity_score: Option<f32>,
}

/// Filters forwarded to the memory store's retrieve call.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MemoryFilters {
    #[serde(default)]
    pub memory_types: Vec<MemoryType>,
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

/// Acknowledgment returned by the communication sink for COMMUNICATE.
/// Delivery is at-most-once; retries are the sender's responsibility.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub recipient: String,
    pub delivered_at: DateTime<Utc>,
}

/// Logical schema of one durable cognition-log row.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CognitionLogRecord {
    pub cognition_id: CognitionId,
    pub agent_id: AgentId,
    pub operation: String,
    pub input_serialized: String,
    pub result_serialized: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_id: Option<CognitionId>,
    pub causality_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_keywords_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_keyword(op.keyword()), Some(op));
        }
        // Keywords are case-sensitive.
        assert_eq!(Operation::from_keyword("query"), None);
        assert_eq!(Operation::from_keyword("On-Fail"), None);
    }

    #[test]
    fn entity_equality_is_structural() {
        let a = Entity::with_payload("shell", AilValue::String("ls".into()));
        let b = Entity::with_payload("shell", AilValue::String("ls".into()));
        let c = Entity::named("shell");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn recoverability_matches_taxonomy() {
        assert!(!CognitionError::Parse("x".into()).is_recoverable());
        assert!(!CognitionError::Security("x".into()).is_recoverable());
        assert!(!CognitionError::Validation("x".into()).is_recoverable());
        assert!(!CognitionError::PolicyViolation("x".into()).is_recoverable());
        assert!(!CognitionError::Internal("x".into()).is_recoverable());

        assert!(CognitionError::UnknownTool { tool: "t".into() }.is_recoverable());
        assert!(CognitionError::ToolFailure {
            tool: "t".into(),
            cause: "boom".into()
        }
        .is_recoverable());
        assert!(CognitionError::ToolTimeout { tool: "t".into() }.is_recoverable());
        assert!(CognitionError::Timeout("await".into()).is_recoverable());
        assert!(CognitionError::MemoryStore("down".into()).is_recoverable());
        assert!(CognitionError::UnboundVariable { name: "x".into() }.is_recoverable());
    }

    #[test]
    fn error_serializes_with_kind_tag() {
        let err = CognitionError::ToolTimeout { tool: "shell".into() };
        let value = serde_json::to_value(&err).expect("serialization should succeed");
        assert_eq!(value["kind"], json!("tool_timeout"));

        let back: CognitionError =
            serde_json::from_value(value).expect("deserialization should succeed");
        assert_eq!(back, err);
    }

    #[test]
    fn file_access_ordering() {
        assert!(FileAccess::ReadWrite.permits(FileAccess::Read));
        assert!(FileAccess::Read.permits(FileAccess::None));
        assert!(!FileAccess::None.permits(FileAccess::Read));
        assert!(!FileAccess::Read.permits(FileAccess::ReadWrite));
    }

    #[test]
    fn sandbox_defaults() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.memory_limit_mb, 64);
        assert_eq!(cfg.cpu_limit_ms, 1000);
        assert!(!cfg.network_access);
        assert_eq!(cfg.file_access, FileAccess::None);
        assert!(cfg.allowed_operations.is_empty());
    }

    #[test]
    fn node_count_walks_nested_values() {
        let leaf = Cognition {
            cognition_id: Uuid::new_v4(),
            parent_id: None,
            operation: Operation::Execute,
            args: vec![AilValue::Entity(Entity::named("kv"))],
            metadata: BTreeMap::new(),
        };
        let root = Cognition {
            cognition_id: Uuid::new_v4(),
            parent_id: None,
            operation: Operation::Plan,
            args: vec![
                AilValue::Map(BTreeMap::new()),
                AilValue::Cognition(Box::new(leaf.clone())),
                AilValue::Array(vec![AilValue::Cognition(Box::new(leaf))]),
            ],
            metadata: BTreeMap::new(),
        };
        assert_eq!(root.node_count(), 3);
    }

    #[test]
    fn cognition_result_round_trip() {
        let original = CognitionResult::ok(json!({"value": "hello"}), 12);
        let encoded = serde_json::to_string(&original).expect("serialization should succeed");
        let decoded: CognitionResult =
            serde_json::from_str(&encoded).expect("deserialization should succeed");
        assert!(decoded.success);
        assert_eq!(decoded.value, original.value);
        assert_eq!(decoded.execution_time_ms, 12);
    }
}
