//! Batch index orchestrator state machine, markers and delta behavior.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use graph_rag::metrics::MetricsRegistry;
use graph_rag::models::{IngestStatus, NodeFilter};
use graph_rag::orchestrator::{IndexOrchestrator, RunStatus, LOCKFILE_NAME};
use graph_rag::services::extraction::Extractor;
use graph_rag::store::SqlStore;
use serde_json::Value;
use tempfile::TempDir;

struct Harness {
    store: SqlStore,
    orchestrator: IndexOrchestrator,
    metrics: Arc<MetricsRegistry>,
    artifacts: TempDir,
    raw_docs: TempDir,
}

async fn harness() -> Harness {
    let store = SqlStore::in_memory().await.unwrap();
    let metrics = Arc::new(MetricsRegistry::new());
    let artifacts = TempDir::new().unwrap();
    let raw_docs = TempDir::new().unwrap();
    let orchestrator = IndexOrchestrator::new(
        store.clone(),
        Arc::new(Extractor::new(None)),
        metrics.clone(),
        artifacts.path().to_path_buf(),
        raw_docs.path().to_path_buf(),
    );
    Harness {
        store,
        orchestrator,
        metrics,
        artifacts,
        raw_docs,
    }
}

fn run_dirs(artifacts: &Path) -> Vec<String> {
    fs::read_dir(artifacts)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.starts_with("run-"))
                .collect()
        })
        .unwrap_or_default()
}

/// Flip one doc to stale: first ingest-log write, then a changed hash.
async fn make_stale_doc(store: &SqlStore, doc_id: &str, namespace: &str) {
    store
        .upsert_ingest_log(doc_id, namespace, "hash-1", Value::Object(Default::default()))
        .await
        .unwrap();
    store
        .upsert_ingest_log(doc_id, namespace, "hash-2", Value::Object(Default::default()))
        .await
        .unwrap();
}

#[tokio::test]
async fn noop_when_nothing_is_stale() {
    let h = harness().await;
    let outcome = h.orchestrator.orchestrate("public", false, false, None, None).await;
    assert_eq!(outcome.status, RunStatus::Noop);
    assert_eq!(outcome.stale_docs, 0);
    assert!(outcome.staging_dir.is_none());
    assert!(run_dirs(h.artifacts.path()).is_empty());
}

#[tokio::test]
async fn dry_run_creates_no_staging() {
    let h = harness().await;
    make_stale_doc(&h.store, "doc1", "public").await;
    let outcome = h.orchestrator.orchestrate("public", false, true, None, None).await;
    assert_eq!(outcome.status, RunStatus::DryRun);
    assert!(outcome.dry_run);
    assert!(outcome.staging_dir.is_some());
    assert!(run_dirs(h.artifacts.path()).is_empty());
}

#[tokio::test]
async fn locked_run_writes_no_markers() {
    let h = harness().await;
    make_stale_doc(&h.store, "doc1", "public").await;
    fs::write(h.artifacts.path().join(LOCKFILE_NAME), "held").unwrap();

    let outcome = h.orchestrator.orchestrate("public", false, false, None, None).await;
    assert_eq!(outcome.status, RunStatus::Locked);
    assert!(run_dirs(h.artifacts.path()).is_empty());

    // A forced run proceeds despite contention.
    fs::write(h.raw_docs.path().join("doc1.txt"), "Atlas Vega Polaris shine.").unwrap();
    let forced = h.orchestrator.orchestrate("public", true, false, None, None).await;
    assert_eq!(forced.status, RunStatus::Success);
}

#[tokio::test]
async fn stale_doc_run_imports_and_marks_indexed() {
    let h = harness().await;
    make_stale_doc(&h.store, "doc1", "public").await;
    fs::write(
        h.raw_docs.path().join("doc1.txt"),
        "Altair Deneb and Vega form the Summer Triangle. Altair outshines Deneb.",
    )
    .unwrap();

    let outcome = h.orchestrator.orchestrate("public", false, false, None, None).await;
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.stale_docs, 1);
    assert_eq!(outcome.total_docs, 1);

    let staging = Path::new(outcome.staging_dir.as_ref().unwrap());
    for artifact in [
        "entities.csv",
        "relationships.csv",
        "communities.csv",
        "community_reports.csv",
        "_RUNNING",
        "_SUCCESS",
    ] {
        assert!(staging.join(artifact).exists(), "missing {}", artifact);
    }
    assert!(!staging.join("_FAILED").exists());
    assert!(h.artifacts.path().join("latest").exists());

    // Imported entities are queryable in the namespace.
    let imported = h
        .store
        .scan_nodes(&NodeFilter::namespace("public"))
        .await
        .unwrap();
    assert!(imported.iter().any(|n| n.name == "Altair"));

    // The stale doc moved to indexed.
    let log = h.store.ingest_log("public").await.unwrap();
    assert_eq!(log[0].status, IngestStatus::Indexed);
    assert!(log[0].last_indexed_at.is_some());

    // Lock released: a follow-up run short-circuits to NOOP.
    let again = h.orchestrator.orchestrate("public", false, false, None, None).await;
    assert_eq!(again.status, RunStatus::Noop);
    assert!(!h.artifacts.path().join(LOCKFILE_NAME).exists());
}

#[tokio::test]
async fn reuse_metrics_stay_in_bounds_on_reimport() {
    let h = harness().await;
    fs::write(
        h.raw_docs.path().join("doc1.txt"),
        "Castor and Pollux are the Gemini twins.",
    )
    .unwrap();

    let first = h.orchestrator.orchestrate("public", true, false, None, None).await;
    assert_eq!(first.status, RunStatus::Success);
    let second = h.orchestrator.orchestrate("public", true, false, None, None).await;
    assert_eq!(second.status, RunStatus::Success);

    // Same artifacts imported twice: everything merges the second time.
    let reused = h
        .metrics
        .gauge("last_index_percent_reused_nodes")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((0.0..=1.0).contains(&reused));
    assert!(reused > 0.99);
    let delta_nodes = h
        .metrics
        .gauge("last_index_delta_nodes")
        .and_then(|v| v.as_u64())
        .unwrap();
    assert_eq!(delta_nodes, 0);

    // Import stayed idempotent at the store level.
    let names: Vec<String> = h
        .store
        .scan_nodes(&NodeFilter::namespace("public"))
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    let castor_count = names.iter().filter(|n| n.as_str() == "Castor").count();
    assert_eq!(castor_count, 1);
}

#[tokio::test]
async fn retention_prunes_old_runs() {
    let h = harness().await;
    fs::write(h.raw_docs.path().join("doc1.txt"), "Rigel Sirius Procyon.").unwrap();
    for _ in 0..3 {
        let outcome = h.orchestrator.orchestrate("public", true, false, None, Some(2)).await;
        assert_eq!(outcome.status, RunStatus::Success);
        // Run directory names have second precision.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    }
    assert!(run_dirs(h.artifacts.path()).len() <= 2);
}

#[tokio::test]
async fn status_gauges_track_last_run() {
    let h = harness().await;
    let outcome = h.orchestrator.orchestrate("public", false, false, None, None).await;
    assert_eq!(outcome.status, RunStatus::Noop);
    assert_eq!(
        h.metrics.gauge("last_index_status").unwrap(),
        Value::from("NOOP")
    );
    assert!(h.metrics.gauge("last_index_run_at").is_some());
    assert_eq!(h.metrics.counter("index_runs_total"), 1);
    assert_eq!(h.metrics.counter("index_runs_noop_total"), 1);
}
