//! Pathfinding, clustering and centrality over seeded graphs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use graph_rag::models::{label, relation, GraphEdge, GraphNode, NodeFilter};
use graph_rag::services::cluster::ALGORITHM;
use graph_rag::state::AppState;
use graphrag_config::AppConfig;

async fn test_state() -> Arc<AppState> {
    AppState::build(AppConfig::default()).await.unwrap()
}

async fn seed_chain(state: &AppState, ids: &[&str], namespace: &str) {
    let nodes: Vec<GraphNode> = ids
        .iter()
        .map(|id| GraphNode::new(*id, label::ENTITY, *id, namespace))
        .collect();
    state.store.sql().upsert_nodes(&nodes).await.unwrap();
    let edges: Vec<GraphEdge> = ids
        .windows(2)
        .map(|pair| GraphEdge::new(pair[0], pair[1], relation::LINKS, 0.9, namespace))
        .collect();
    state.store.sql().upsert_edges(&edges).await.unwrap();
}

async fn seed_clique(state: &AppState, prefix: &str, size: usize, namespace: &str) {
    let ids: Vec<String> = (0..size).map(|i| format!("{}{}", prefix, i)).collect();
    let nodes: Vec<GraphNode> = ids
        .iter()
        .map(|id| GraphNode::new(id.clone(), label::ENTITY, format!("{} node", id), namespace))
        .collect();
    state.store.sql().upsert_nodes(&nodes).await.unwrap();
    let mut edges = Vec::new();
    for i in 0..size {
        for j in (i + 1)..size {
            edges.push(GraphEdge::new(
                ids[i].clone(),
                ids[j].clone(),
                relation::LINKS,
                0.9,
                namespace,
            ));
        }
    }
    state.store.sql().upsert_edges(&edges).await.unwrap();
}

#[tokio::test]
async fn shortest_path_over_chain() {
    let state = test_state().await;
    seed_chain(&state, &["A", "B", "C", "D"], "public").await;

    let path = state
        .pathfinder
        .shortest_path("A", "D", 5, "public")
        .await
        .unwrap();
    assert_eq!(path, vec!["A", "B", "C", "D"]);

    let edges = state.pathfinder.path_edges(&path, "public").await.unwrap();
    assert_eq!(edges.len(), 3);
}

#[tokio::test]
async fn shortest_path_identity_and_miss() {
    let state = test_state().await;
    seed_chain(&state, &["A", "B"], "public").await;

    let same = state
        .pathfinder
        .shortest_path("A", "A", 4, "public")
        .await
        .unwrap();
    assert_eq!(same, vec!["A"]);

    let miss = state
        .pathfinder
        .shortest_path("A", "nowhere", 4, "public")
        .await
        .unwrap();
    assert!(miss.is_empty());
}

#[tokio::test]
async fn path_respects_namespace_scope() {
    let state = test_state().await;
    seed_chain(&state, &["A", "B", "C"], "public").await;
    seed_chain(&state, &["X", "Y"], "other").await;

    // Edges from another namespace must not be traversable.
    let cross = state
        .pathfinder
        .shortest_path("A", "Y", 5, "public")
        .await
        .unwrap();
    assert!(cross.is_empty());
}

#[tokio::test]
async fn louvain_splits_two_cliques() {
    let state = test_state().await;
    seed_clique(&state, "a", 5, "public").await;
    seed_clique(&state, "b", 5, "public").await;

    let result = state.clusters.get_clusters("public", true).await.unwrap();
    assert!(result.stats.clusters >= 2);
    assert_eq!(result.stats.nodes, 10);
    assert!(result.modularity.unwrap() > 0.2);

    // Partition law: every node in exactly one cluster.
    let memberships = state
        .store
        .sql()
        .memberships("public", ALGORITHM)
        .await
        .unwrap();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for m in &memberships {
        *counts.entry(m.node_id.as_str()).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 10);
    assert!(counts.values().all(|&c| c == 1));

    // Synthetic ids are assigned in descending size order.
    assert_eq!(result.clusters[0].id, "c1");
    assert!(result.clusters[0].size >= result.clusters[1].size);
    assert!(result.clusters.iter().all(|c| c.sample_nodes.len() <= 8));
}

#[tokio::test]
async fn cluster_cache_returns_same_result_within_ttl() {
    let state = test_state().await;
    seed_clique(&state, "a", 4, "public").await;

    let first = state.clusters.get_clusters("public", false).await.unwrap();
    let second = state.clusters.get_clusters("public", false).await.unwrap();
    assert_eq!(first.generated_at, second.generated_at);

    let forced = state.clusters.get_clusters("public", true).await.unwrap();
    assert!(forced.generated_at >= first.generated_at);
}

#[tokio::test]
async fn cluster_summaries_fall_back_without_llm() {
    let state = test_state().await;
    seed_clique(&state, "alpha", 5, "public").await;

    let result = state.clusters.get_clusters("public", true).await.unwrap();
    let ids: Vec<String> = result.clusters.iter().map(|c| c.id.clone()).collect();
    let summaries = state
        .clusters
        .summarize_clusters("public", &ids, 120)
        .await
        .unwrap();
    for id in &ids {
        let entry = &summaries[id];
        assert!(!entry.label.is_empty());
        assert!(entry.label.chars().count() <= 120);
        assert!(entry.summary.chars().count() <= 800);
    }

    // Second call hits the persisted summary cache for the same terms.
    let again = state
        .clusters
        .summarize_clusters("public", &ids, 120)
        .await
        .unwrap();
    for id in &ids {
        assert_eq!(summaries[id].label, again[id].label);
    }
}

#[tokio::test]
async fn clusters_are_namespace_scoped() {
    let state = test_state().await;
    seed_clique(&state, "a", 5, "teamA").await;
    seed_clique(&state, "b", 5, "teamB").await;

    let a = state.clusters.get_clusters("teamA", true).await.unwrap();
    let b = state.clusters.get_clusters("teamB", true).await.unwrap();
    let ids_a: HashSet<String> = a
        .clusters
        .iter()
        .flat_map(|c| c.node_ids.clone())
        .collect();
    let ids_b: HashSet<String> = b
        .clusters
        .iter()
        .flat_map(|c| c.node_ids.clone())
        .collect();
    assert!(ids_a.is_disjoint(&ids_b));
}

#[tokio::test]
async fn centrality_writes_normalized_metrics() {
    let state = test_state().await;
    seed_chain(&state, &["A", "B", "C", "D", "E"], "public").await;

    let layout = state
        .layout
        .recompute_layout("public", graph_rag::services::layout::LayoutMode::Hybrid)
        .await
        .unwrap();
    assert!(layout.success);
    let outcome = state.layout.compute_centrality("public").await.unwrap();
    assert!(outcome.success);
    assert!(outcome.have_pagerank);
    assert!(outcome.have_betweenness);

    let nodes = state
        .store
        .sql()
        .scan_nodes(&NodeFilter::namespace("public"))
        .await
        .unwrap();
    for node in &nodes {
        for key in ["degree_norm", "pagerank_norm", "betweenness_norm"] {
            if let Some(v) = node.prop_f64(key) {
                assert!((0.0..=1.0).contains(&v), "{} out of range: {}", key, v);
            }
        }
        let degree = node.prop_f64("degree").unwrap();
        assert!(degree >= 0.0);
        assert!(node.prop_f64("importance").is_some());
        assert!(node.layout_xy().is_some());
    }

    // The middle of the chain is the most between.
    let by_id: HashMap<&str, f64> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.prop_f64("betweenness_norm").unwrap()))
        .collect();
    assert!(by_id["C"] >= by_id["A"]);
    assert!(by_id["C"] >= by_id["E"]);
}
