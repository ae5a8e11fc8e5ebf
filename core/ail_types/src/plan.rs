//! Typed query plans produced by the planner for QUERY cognitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{MemoryType, PlanId};

/// Retrieval mode selected by QUERY metadata. Unknown modes fail validation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Standard,
    Explore,
    Connect,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Standard => "standard",
            QueryMode::Explore => "explore",
            QueryMode::Connect => "connect",
        }
    }

    pub fn from_str(mode: &str) -> Option<QueryMode> {
        match mode {
            "standard" => Some(QueryMode::Standard),
            "explore" => Some(QueryMode::Explore),
            "connect" => Some(QueryMode::Connect),
            _ => None,
        }
    }
}

/// Stage kinds a plan may contain, per mode template.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    TimeFilter,
    TypeFilter,
    VectorSearch,
    RankResults,
    CategoryAnalysis,
    FacetGeneration,
    TopResults,
    NodeIdentification,
    GraphTraversal,
    PathRanking,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::TimeFilter => "time_filter",
            StageKind::TypeFilter => "type_filter",
            StageKind::VectorSearch => "vector_search",
            StageKind::RankResults => "rank_results",
            StageKind::CategoryAnalysis => "category_analysis",
            StageKind::FacetGeneration => "facet_generation",
            StageKind::TopResults => "top_results",
            StageKind::NodeIdentification => "node_identification",
            StageKind::GraphTraversal => "graph_traversal",
            StageKind::PathRanking => "path_ranking",
        }
    }
}

/// Recognized relative time references in query intents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeReference {
    Today,
    Yesterday,
    LastWeek,
    LastMonth,
}

/// Coarse action classes tagged from intent text.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    Search,
    Connect,
    Summarize,
}

/// Structured shape extracted from a QUERY intent string. The tagging pass
/// is keyword-based, deterministic, and case-insensitive.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ParsedIntent {
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub time_references: Vec<TimeReference>,
    #[serde(default)]
    pub memory_types: Vec<MemoryType>,
    #[serde(default)]
    pub actions: Vec<IntentAction>,
}

/// One stage of a query plan. Stage time estimates tie-break by index.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlanStage {
    pub index: usize,
    pub kind: StageKind,
    pub description: String,
    pub estimated_ms: u64,
}

/// Ordered retrieval plan for one QUERY cognition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueryPlan {
    pub plan_id: PlanId,
    pub mode: QueryMode,
    pub intent: String,
    pub parsed_intent: ParsedIntent,
    pub stages: Vec<PlanStage>,
    /// Confidence in [0, 1], monotone in recognized entities + constraints.
    pub confidence: f64,
    pub estimated_total_ms: u64,
}

impl QueryPlan {
    pub fn new(mode: QueryMode, intent: String, parsed_intent: ParsedIntent) -> Self {
        QueryPlan {
            plan_id: Uuid::new_v4(),
            mode,
            intent,
            parsed_intent,
            stages: Vec::new(),
            confidence: 0.0,
            estimated_total_ms: 0,
        }
    }
}
