//! Query planner: turns a QUERY intent into an ordered plan of typed
//! retrieval stages and executes it against the memory store.
//!
//! Intent tagging is keyword-based, deterministic, and case-insensitive.
//! The planner never calls tools; its only external call is the store's
//! retrieve interface with the refined query.

use std::sync::Arc;

use ail_types::{
    CognitionError, IntentAction, MemoryFilters, MemoryRecord, MemoryType, ParsedIntent,
    PlanStage, QueryMode, QueryPlan, StageKind, TimeReference,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::memory::{EmbeddingProvider, MemoryStore};

/// Bounded neighbor fan-out for connect-mode traversal.
const MAX_TRAVERSAL_DEGREE: usize = 3;

/// Words ignored by entity and facet extraction.
const STOPWORDS: [&str; 18] = [
    "a", "an", "the", "of", "in", "on", "to", "for", "and", "or", "with", "about", "from", "is",
    "are", "was", "were", "my",
];

/// Tag an intent string into its structured shape.
pub fn parse_intent(intent: &str) -> ParsedIntent {
    let lowered = intent.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|t| !t.is_empty())
        .collect();

    let mut parsed = ParsedIntent::default();

    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "today" => push_unique(&mut parsed.time_references, TimeReference::Today),
            "yesterday" => push_unique(&mut parsed.time_references, TimeReference::Yesterday),
            "week" if i > 0 && tokens[i - 1] == "last" => {
                push_unique(&mut parsed.time_references, TimeReference::LastWeek)
            }
            "month" if i > 0 && tokens[i - 1] == "last" => {
                push_unique(&mut parsed.time_references, TimeReference::LastMonth)
            }
            "episodic" | "event" | "events" => {
                push_unique(&mut parsed.memory_types, MemoryType::Episodic)
            }
            "semantic" | "fact" | "facts" | "concept" | "concepts" => {
                push_unique(&mut parsed.memory_types, MemoryType::Semantic)
            }
            "procedural" | "procedure" | "procedures" | "steps" => {
                push_unique(&mut parsed.memory_types, MemoryType::Procedural)
            }
            "search" | "find" | "retrieve" | "lookup" | "recall" => {
                push_unique(&mut parsed.actions, IntentAction::Search)
            }
            "connect" | "relate" | "link" | "relationship" | "relationships" => {
                push_unique(&mut parsed.actions, IntentAction::Connect)
            }
            "summarize" | "summary" | "overview" => {
                push_unique(&mut parsed.actions, IntentAction::Summarize)
            }
            _ => {}
        }
    }

    // Entities: remaining content words, lowercased and deduplicated in
    // first-seen order.
    for token in &tokens {
        if token.len() < 3 || STOPWORDS.contains(token) || is_tagged_keyword(token) {
            continue;
        }
        if !parsed.entities.iter().any(|e| e == token) {
            parsed.entities.push(token.to_string());
        }
    }

    parsed
}

fn is_tagged_keyword(token: &str) -> bool {
    matches!(
        token,
        "today"
            | "yesterday"
            | "last"
            | "week"
            | "month"
            | "episodic"
            | "event"
            | "events"
            | "semantic"
            | "fact"
            | "facts"
            | "concept"
            | "concepts"
            | "procedural"
            | "procedure"
            | "procedures"
            | "steps"
            | "search"
            | "find"
            | "retrieve"
            | "lookup"
            | "recall"
            | "connect"
            | "relate"
            | "link"
            | "relationship"
            | "relationships"
            | "summarize"
            | "summary"
            | "overview"
    )
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

fn stage_estimate_ms(kind: StageKind) -> u64 {
    match kind {
        StageKind::TimeFilter | StageKind::TypeFilter => 5,
        StageKind::VectorSearch => 50,
        StageKind::RankResults => 10,
        StageKind::CategoryAnalysis => 40,
        StageKind::FacetGeneration => 20,
        StageKind::TopResults => 10,
        StageKind::NodeIdentification => 30,
        StageKind::GraphTraversal => 80,
        StageKind::PathRanking => 15,
    }
}

/// Build the typed plan for an intent and mode.
pub fn build_plan(intent: &str, mode: QueryMode) -> QueryPlan {
    let parsed = parse_intent(intent);
    let mut plan = QueryPlan::new(mode, intent.to_string(), parsed);

    let kinds: Vec<StageKind> = match mode {
        QueryMode::Standard => {
            let mut kinds = Vec::new();
            if !plan.parsed_intent.time_references.is_empty() {
                kinds.push(StageKind::TimeFilter);
            }
            if !plan.parsed_intent.memory_types.is_empty() {
                kinds.push(StageKind::TypeFilter);
            }
            kinds.push(StageKind::VectorSearch);
            kinds.push(StageKind::RankResults);
            kinds
        }
        QueryMode::Explore => vec![
            StageKind::CategoryAnalysis,
            StageKind::FacetGeneration,
            StageKind::TopResults,
        ],
        QueryMode::Connect => vec![
            StageKind::NodeIdentification,
            StageKind::GraphTraversal,
            StageKind::PathRanking,
        ],
    };

    plan.stages = kinds
        .into_iter()
        .enumerate()
        .map(|(index, kind)| PlanStage {
            index,
            kind,
            description: format!("{} over '{}'", kind.as_str(), plan.intent),
            estimated_ms: stage_estimate_ms(kind),
        })
        .collect();
    plan.estimated_total_ms = plan.stages.iter().map(|s| s.estimated_ms).sum();
    plan.confidence = confidence_score(&plan);

    debug!(
        plan_id = %plan.plan_id,
        mode = plan.mode.as_str(),
        stages = plan.stages.len(),
        confidence = plan.confidence,
        "query plan built"
    );
    plan
}

/// Monotone in recognized entities plus time/type constraints.
fn confidence_score(plan: &QueryPlan) -> f64 {
    let entities = plan.parsed_intent.entities.len().min(4) as f64;
    let has_time = !plan.parsed_intent.time_references.is_empty() as u8 as f64;
    let has_types = !plan.parsed_intent.memory_types.is_empty() as u8 as f64;
    let stages = plan.stages.len().min(4) as f64;

    (0.2 + 0.1 * entities + 0.1 * has_time + 0.1 * has_types + 0.05 * stages).min(1.0)
}

/// Results of walking a plan's stages against the memory store.
pub struct PlanExecution {
    pub memories: Vec<MemoryRecord>,
    /// Mode-specific artifacts: categories, facets, or paths.
    pub artifacts: serde_json::Map<String, Value>,
}

fn time_filters(refs: &[TimeReference]) -> (Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>) {
    let now = Utc::now();
    let mut after = None;
    let mut before = None;
    for reference in refs {
        match reference {
            TimeReference::Today => after = Some(now - Duration::days(1)),
            TimeReference::Yesterday => {
                after = Some(now - Duration::days(2));
                before = Some(now - Duration::days(1));
            }
            TimeReference::LastWeek => after = Some(now - Duration::days(7)),
            TimeReference::LastMonth => after = Some(now - Duration::days(30)),
        }
    }
    (after, before)
}

async fn embed_intent(
    embedder: &Arc<dyn EmbeddingProvider>,
    intent: &str,
) -> Result<Vec<f32>, CognitionError> {
    embedder
        .embed(intent)
        .await
        .map_err(|e| CognitionError::MemoryStore(format!("embedding failed: {e}")))
}

async fn retrieve(
    store: &Arc<dyn MemoryStore>,
    embedding: Vec<f32>,
    filters: MemoryFilters,
    limit: usize,
) -> Result<Vec<MemoryRecord>, CognitionError> {
    store
        .retrieve(embedding, filters, limit)
        .await
        .map_err(CognitionError::MemoryStore)
}

/// Walk the plan's stages in order, each consuming the previous stage's
/// output.
pub async fn execute_plan(
    plan: &QueryPlan,
    store: &Arc<dyn MemoryStore>,
    embedder: &Arc<dyn EmbeddingProvider>,
    max_results: usize,
    similarity_threshold: Option<f32>,
) -> Result<PlanExecution, CognitionError> {
    match plan.mode {
        QueryMode::Standard => {
            execute_standard(plan, store, embedder, max_results, similarity_threshold).await
        }
        QueryMode::Explore => execute_explore(plan, store, embedder, max_results).await,
        QueryMode::Connect => execute_connect(plan, store, embedder, max_results).await,
    }
}

async fn execute_standard(
    plan: &QueryPlan,
    store: &Arc<dyn MemoryStore>,
    embedder: &Arc<dyn EmbeddingProvider>,
    max_results: usize,
    similarity_threshold: Option<f32>,
) -> Result<PlanExecution, CognitionError> {
    let mut filters = MemoryFilters {
        min_similarity: similarity_threshold,
        ..Default::default()
    };

    for stage in &plan.stages {
        match stage.kind {
            StageKind::TimeFilter => {
                let (after, before) = time_filters(&plan.parsed_intent.time_references);
                filters.after = after;
                filters.before = before;
            }
            StageKind::TypeFilter => {
                filters.memory_types = plan.parsed_intent.memory_types.clone();
            }
            _ => {}
        }
    }

    let embedding = embed_intent(embedder, &plan.intent).await?;
    let mut memories = retrieve(store, embedding, filters, max_results).await?;

    // RANK_RESULTS: the store already ranks; reapply the tie-breaks so the
    // ordering contract holds for any store implementation.
    memories.sort_by(|a, b| {
        let score_a = a.similarity_score.unwrap_or(0.0);
        let score_b = b.similarity_score.unwrap_or(0.0);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    Ok(PlanExecution {
        memories,
        artifacts: serde_json::Map::new(),
    })
}

async fn execute_explore(
    plan: &QueryPlan,
    store: &Arc<dyn MemoryStore>,
    embedder: &Arc<dyn EmbeddingProvider>,
    max_results: usize,
) -> Result<PlanExecution, CognitionError> {
    let embedding = embed_intent(embedder, &plan.intent).await?;
    let pool_size = (max_results * 3).max(30);
    let pool = retrieve(store, embedding, MemoryFilters::default(), pool_size).await?;

    // CATEGORY_ANALYSIS: distribution over memory types.
    let mut categories = serde_json::Map::new();
    for memory_type in [MemoryType::Episodic, MemoryType::Semantic, MemoryType::Procedural] {
        let count = pool.iter().filter(|r| r.memory_type == memory_type).count();
        categories.insert(memory_type.as_str().to_string(), json!(count));
    }

    // FACET_GENERATION: most frequent content words across the pool.
    let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
    for record in &pool {
        for token in record
            .content
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        {
            *counts.entry(token.to_string()).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let facets: Vec<Value> = ranked
        .into_iter()
        .take(8)
        .map(|(facet, count)| json!({ "facet": facet, "count": count }))
        .collect();

    let mut artifacts = serde_json::Map::new();
    artifacts.insert("categories".to_string(), Value::Object(categories));
    artifacts.insert("facets".to_string(), Value::Array(facets));

    // TOP_RESULTS.
    let mut memories = pool;
    memories.truncate(max_results);

    Ok(PlanExecution { memories, artifacts })
}

async fn execute_connect(
    plan: &QueryPlan,
    store: &Arc<dyn MemoryStore>,
    embedder: &Arc<dyn EmbeddingProvider>,
    max_results: usize,
) -> Result<PlanExecution, CognitionError> {
    // NODE_IDENTIFICATION: seed nodes per recognized entity, or from the
    // whole intent when nothing was tagged.
    let mut seeds = Vec::new();
    let seed_queries: Vec<String> = if plan.parsed_intent.entities.is_empty() {
        vec![plan.intent.clone()]
    } else {
        plan.parsed_intent.entities.clone()
    };
    for query in seed_queries.iter().take(MAX_TRAVERSAL_DEGREE) {
        let embedding = embed_intent(embedder, query).await?;
        let mut hits = retrieve(store, embedding, MemoryFilters::default(), 2).await?;
        seeds.append(&mut hits);
    }

    // GRAPH_TRAVERSAL: one bounded hop from each seed through content
    // similarity.
    let mut paths = Vec::new();
    let mut memories: Vec<MemoryRecord> = seeds.clone();
    for seed in seeds.iter().take(MAX_TRAVERSAL_DEGREE) {
        let embedding = embed_intent(embedder, &seed.content).await?;
        let neighbors = retrieve(
            store,
            embedding,
            MemoryFilters::default(),
            MAX_TRAVERSAL_DEGREE + 1,
        )
        .await?;
        for neighbor in neighbors {
            if neighbor.id == seed.id {
                continue;
            }
            paths.push(json!({
                "from": seed.id,
                "to": neighbor.id,
                "score": neighbor.similarity_score.unwrap_or(0.0),
            }));
            if !memories.iter().any(|m| m.id == neighbor.id) {
                memories.push(neighbor);
            }
        }
    }

    // PATH_RANKING: strongest connections first.
    paths.sort_by(|a, b| {
        let score_a = a["score"].as_f64().unwrap_or(0.0);
        let score_b = b["score"].as_f64().unwrap_or(0.0);
        score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
    });
    memories.truncate(max_results);

    let mut artifacts = serde_json::Map::new();
    artifacts.insert("paths".to_string(), Value::Array(paths));

    Ok(PlanExecution { memories, artifacts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashEmbedder, InMemoryStore};

    #[test]
    fn intent_tagging_is_case_insensitive() {
        let a = parse_intent("Find SEMANTIC facts about Rust from last week");
        let b = parse_intent("find semantic facts about rust from LAST WEEK");
        assert_eq!(a.memory_types, b.memory_types);
        assert_eq!(a.time_references, b.time_references);
        assert_eq!(a.entities, b.entities);
        assert_eq!(a.memory_types, vec![MemoryType::Semantic]);
        assert_eq!(a.time_references, vec![TimeReference::LastWeek]);
        assert_eq!(a.actions, vec![IntentAction::Search]);
        assert!(a.entities.contains(&"rust".to_string()));
    }

    #[test]
    fn standard_plan_skips_absent_filters() {
        let plan = build_plan("find rust notes", QueryMode::Standard);
        let kinds: Vec<StageKind> = plan.stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StageKind::VectorSearch, StageKind::RankResults]);

        let plan = build_plan("find episodic notes from yesterday", QueryMode::Standard);
        let kinds: Vec<StageKind> = plan.stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::TimeFilter,
                StageKind::TypeFilter,
                StageKind::VectorSearch,
                StageKind::RankResults,
            ]
        );
    }

    #[test]
    fn mode_templates() {
        let explore = build_plan("explore notes", QueryMode::Explore);
        assert_eq!(
            explore.stages.iter().map(|s| s.kind).collect::<Vec<_>>(),
            vec![
                StageKind::CategoryAnalysis,
                StageKind::FacetGeneration,
                StageKind::TopResults,
            ]
        );

        let connect = build_plan("connect rust and tokio", QueryMode::Connect);
        assert_eq!(
            connect.stages.iter().map(|s| s.kind).collect::<Vec<_>>(),
            vec![
                StageKind::NodeIdentification,
                StageKind::GraphTraversal,
                StageKind::PathRanking,
            ]
        );
    }

    #[test]
    fn confidence_is_monotone_in_recognized_structure() {
        let vague = build_plan("eh", QueryMode::Standard);
        let typed = build_plan("find semantic facts", QueryMode::Standard);
        let constrained = build_plan(
            "find semantic facts about rust kernels from last week",
            QueryMode::Standard,
        );

        assert!(vague.confidence <= typed.confidence);
        assert!(typed.confidence <= constrained.confidence);
        assert!(constrained.confidence <= 1.0);

        // Stable across rebuilds.
        let again = build_plan(
            "find semantic facts about rust kernels from last week",
            QueryMode::Standard,
        );
        assert_eq!(constrained.confidence, again.confidence);
    }

    #[tokio::test]
    async fn standard_execution_retrieves_ranked_memories() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(64));
        let concrete = Arc::new(InMemoryStore::new(embedder.clone()));

        for content in ["rust kernel notes", "tokio runtime facts", "lunch receipt"] {
            concrete
                .store(MemoryRecord {
                    id: uuid::Uuid::new_v4(),
                    content: content.to_string(),
                    memory_type: MemoryType::Semantic,
                    metadata: Value::Null,
                    created_at: Utc::now(),
                    similarity_score: None,
                })
                .await
                .expect("store should succeed");
        }
        let store: Arc<dyn MemoryStore> = concrete;

        let plan = build_plan("find rust kernel", QueryMode::Standard);
        let execution = execute_plan(&plan, &store, &embedder, 2, None)
            .await
            .expect("plan execution should succeed");

        assert_eq!(execution.memories.len(), 2);
        assert!(execution.memories[0].content.contains("rust kernel"));
    }

    #[tokio::test]
    async fn explore_execution_produces_categories_and_facets() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(64));
        let concrete = Arc::new(InMemoryStore::new(embedder.clone()));
        for (content, memory_type) in [
            ("rust kernel design", MemoryType::Semantic),
            ("standup happened monday", MemoryType::Episodic),
        ] {
            concrete
                .store(MemoryRecord {
                    id: uuid::Uuid::new_v4(),
                    content: content.to_string(),
                    memory_type,
                    metadata: Value::Null,
                    created_at: Utc::now(),
                    similarity_score: None,
                })
                .await
                .expect("store should succeed");
        }
        let store: Arc<dyn MemoryStore> = concrete;

        let plan = build_plan("explore everything", QueryMode::Explore);
        let execution = execute_plan(&plan, &store, &embedder, 10, None)
            .await
            .expect("plan execution should succeed");

        assert_eq!(execution.artifacts["categories"]["semantic"], json!(1));
        assert_eq!(execution.artifacts["categories"]["episodic"], json!(1));
        assert!(execution.artifacts["facets"].as_array().is_some());
    }
}
