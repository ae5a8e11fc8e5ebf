//! Recovery, scoping, and causality invariants across full executions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cognition_kernel::comms::LocalSink;
use cognition_kernel::memory::{HashEmbedder, InMemoryStore};
use cognition_kernel::{CognitionKernel, Handler, KernelConfig, ToolRegistration};
use serde_json::json;

async fn bare_kernel(dir: &tempfile::TempDir) -> CognitionKernel {
    let config = KernelConfig {
        log_db_path: dir
            .path()
            .join("log.db")
            .to_str()
            .expect("utf8 path")
            .to_string(),
        ..Default::default()
    };
    let embedder = Arc::new(HashEmbedder::new(32));
    CognitionKernel::new(
        config,
        Arc::new(InMemoryStore::new(embedder.clone())),
        embedder,
        Arc::new(LocalSink::new()),
    )
    .await
    .expect("kernel should build")
}

#[tokio::test]
async fn recovery_runs_exactly_once_on_recoverable_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;

    let recovery_calls = Arc::new(AtomicU32::new(0));
    let counter = recovery_calls.clone();
    kernel
        .register_tool(
            ToolRegistration::new("recovery_probe", "counts invocations"),
            Handler::cooperative(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("recovered"))
                }
            }),
        )
        .await
        .expect("register probe");
    kernel
        .register_tool(
            ToolRegistration::new("flaky", "always raises"),
            Handler::cooperative(|_| async move { Err("raised".to_string()) }),
        )
        .await
        .expect("register flaky");

    let result = kernel
        .execute(
            r#"(TRY (EXECUTE [flaky] []) ON-FAIL (EXECUTE [recovery_probe] []))"#,
            "agent-1",
        )
        .await;
    assert!(result.success);
    assert_eq!(recovery_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recovery_is_skipped_when_attempt_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;

    let recovery_calls = Arc::new(AtomicU32::new(0));
    let counter = recovery_calls.clone();
    kernel
        .register_tool(
            ToolRegistration::new("recovery_probe", "counts invocations"),
            Handler::cooperative(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("recovered"))
                }
            }),
        )
        .await
        .expect("register probe");
    kernel
        .register_tool(
            ToolRegistration::new("kv", "echo"),
            Handler::cooperative(|params| async move { Ok(params) }),
        )
        .await
        .expect("register kv");

    let result = kernel
        .execute(
            r#"(TRY (EXECUTE [kv] ["fine"]) ON-FAIL (EXECUTE [recovery_probe] []))"#,
            "agent-1",
        )
        .await;
    assert!(result.success);
    assert_eq!(result.value, json!("fine"));
    assert_eq!(recovery_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unrecoverable_errors_bypass_try() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;
    kernel
        .register_tool(
            ToolRegistration::new("kv", "echo"),
            Handler::cooperative(|params| async move { Ok(params) }),
        )
        .await
        .expect("register kv");

    // The attempt contains a QUERY with an unknown mode, a validation
    // failure caught before evaluation; TRY never gets a chance.
    let result = kernel
        .execute(
            r#"(TRY (QUERY {"intent": "x", "mode": "sideways"}) ON-FAIL (EXECUTE [kv] ["r"]))"#,
            "agent-1",
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some("validation"));
    assert!(result.causality_chain.is_empty());
}

#[tokio::test]
async fn bindings_do_not_leak_across_let_boundaries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;
    kernel
        .register_tool(
            ToolRegistration::new("kv", "echo"),
            Handler::cooperative(|params| async move { Ok(params) }),
        )
        .await
        .expect("register kv");

    // The second PLAN child references x after the LET returned; with the
    // frame gone the name resolves as an opaque entity again at level 0.
    let result = kernel
        .execute(
            r#"(PLAN {"goal": "leak check"} (LET ((x (EXECUTE [kv] ["42"]))) (EXECUTE [kv] [x])) (EXECUTE [kv] [x]))"#,
            "agent-1",
        )
        .await;

    assert!(result.success);
    let stages = result.value["stages"].as_array().expect("stages");
    assert_eq!(stages[0]["value"], json!("42"));
    assert_eq!(
        stages[1]["value"],
        json!({ "entity": "x" }),
        "x must be unbound once its LET returns"
    );
}

#[tokio::test]
async fn nested_lets_shadow_and_restore() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;
    kernel
        .register_tool(
            ToolRegistration::new("kv", "echo"),
            Handler::cooperative(|params| async move { Ok(params) }),
        )
        .await
        .expect("register kv");

    let result = kernel
        .execute(
            r#"(LET ((x (EXECUTE [kv] ["outer"]))) (PLAN {"goal": "shadow"} (LET ((x (EXECUTE [kv] ["inner"]))) (EXECUTE [kv] [x])) (EXECUTE [kv] [x])))"#,
            "agent-1",
        )
        .await;

    assert!(result.success, "nested lets should evaluate: {:?}", result.error);
    let stages = result.value["stages"].as_array().expect("stages");
    assert_eq!(stages[0]["value"], json!("inner"));
    assert_eq!(stages[1]["value"], json!("outer"));
}

#[tokio::test]
async fn causality_chain_covers_every_evaluated_node_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;
    kernel
        .register_tool(
            ToolRegistration::new("kv", "echo"),
            Handler::cooperative(|params| async move { Ok(params) }),
        )
        .await
        .expect("register kv");

    let result = kernel
        .execute(
            r#"(PLAN {"goal": "g"} (EXECUTE [kv] ["1"]) (LET ((x (EXECUTE [kv] ["2"]))) (EXECUTE [kv] [x])))"#,
            "agent-1",
        )
        .await;
    assert!(result.success);

    let chain = &result.causality_chain;
    // PLAN, EXECUTE, LET, bound EXECUTE, body EXECUTE.
    assert_eq!(chain.len(), 5);

    // Topological order: every parent recorded before its children.
    for (index, node) in chain.iter().enumerate() {
        if let Some(parent_id) = node.parent_id {
            let parent_pos = chain
                .iter()
                .position(|candidate| candidate.cognition_id == parent_id);
            if let Some(parent_pos) = parent_pos {
                assert!(
                    parent_pos < index,
                    "parent of node {index} appears after it"
                );
            }
        }
        assert!(node.finished_at.is_some());
        assert_eq!(node.success, Some(true));
    }
}

#[tokio::test]
async fn every_failure_still_logs_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = bare_kernel(&dir).await;

    let unknown = kernel.execute(r#"(EXECUTE [nope] [])"#, "agent-1").await;
    assert!(!unknown.success);
    assert_eq!(unknown.error.as_ref().map(|e| e.kind()), Some("unknown_tool"));

    let invalid = kernel.execute(r#"(ON-FAIL)"#, "agent-1").await;
    assert!(!invalid.success);
    assert_eq!(invalid.error.as_ref().map(|e| e.kind()), Some("validation"));

    let records = kernel.recent_log_entries(10).await.expect("log read");
    assert_eq!(records.len(), 2, "every execute appends exactly one record");
    assert!(records.iter().all(|r| !r.success));
}
