//! Snapshot capture and diff laws.

use std::sync::Arc;

use graph_rag::models::{label, GraphNode};
use graph_rag::state::AppState;
use graphrag_config::AppConfig;

async fn test_state() -> Arc<AppState> {
    AppState::build(AppConfig::default()).await.unwrap()
}

#[tokio::test]
async fn snapshot_diff_tracks_node_delta() {
    let state = test_state().await;
    state
        .store
        .sql()
        .upsert_nodes(&[GraphNode::new("n1", label::ENTITY, "One", "public")])
        .await
        .unwrap();

    let first = state.snapshots.create_snapshot("public").await.unwrap();
    state
        .store
        .sql()
        .upsert_nodes(&[GraphNode::new("n2", label::ENTITY, "Two", "public")])
        .await
        .unwrap();
    let second = state.snapshots.create_snapshot("public").await.unwrap();

    let diff = state
        .snapshots
        .diff_snapshots(&first.id, &second.id)
        .await
        .unwrap();
    assert_eq!(diff["delta_nodes"], 1);
    assert_eq!(diff["delta_edges"], 0);
    assert!(diff["clusters"]["added"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_diff_is_antisymmetric() {
    let state = test_state().await;
    state
        .store
        .sql()
        .upsert_nodes(&[
            GraphNode::new("n1", label::ENTITY, "One", "public"),
            GraphNode::new("n2", label::ENTITY, "Two", "public"),
        ])
        .await
        .unwrap();
    let a = state.snapshots.create_snapshot("public").await.unwrap();
    state
        .store
        .sql()
        .upsert_nodes(&[GraphNode::new("n3", label::ENTITY, "Three", "public")])
        .await
        .unwrap();
    let b = state.snapshots.create_snapshot("public").await.unwrap();

    let ab = state.snapshots.diff_snapshots(&a.id, &b.id).await.unwrap();
    let ba = state.snapshots.diff_snapshots(&b.id, &a.id).await.unwrap();
    assert_eq!(
        ab["delta_nodes"].as_i64().unwrap(),
        -ba["delta_nodes"].as_i64().unwrap()
    );
    assert_eq!(
        ab["delta_edges"].as_i64().unwrap(),
        -ba["delta_edges"].as_i64().unwrap()
    );
}

#[tokio::test]
async fn snapshots_list_most_recent_first() {
    let state = test_state().await;
    let first = state.snapshots.create_snapshot("public").await.unwrap();
    let second = state.snapshots.create_snapshot("public").await.unwrap();

    let listed = state.snapshots.list_snapshots("public", 10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].created_at >= listed[1].created_at);
    assert!(listed.iter().any(|s| s.id == first.id));
    assert!(listed.iter().any(|s| s.id == second.id));
}

#[tokio::test]
async fn diff_of_missing_snapshot_is_not_found() {
    let state = test_state().await;
    let real = state.snapshots.create_snapshot("public").await.unwrap();
    let err = state
        .snapshots
        .diff_snapshots(&real.id, "missing-id")
        .await
        .unwrap_err();
    assert_eq!(err.category(), "not-found");
}

#[tokio::test]
async fn snapshots_are_namespace_scoped() {
    let state = test_state().await;
    state
        .store
        .sql()
        .upsert_nodes(&[GraphNode::new("n1", label::ENTITY, "One", "teamA")])
        .await
        .unwrap();
    let snap = state.snapshots.create_snapshot("teamA").await.unwrap();
    assert_eq!(snap.node_count, 1);

    let other = state.snapshots.create_snapshot("teamB").await.unwrap();
    assert_eq!(other.node_count, 0);
    assert!(state
        .snapshots
        .list_snapshots("teamB", 10)
        .await
        .unwrap()
        .iter()
        .all(|s| s.namespace == "teamB"));
}
