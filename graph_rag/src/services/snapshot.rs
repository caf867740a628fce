//! Periodic graph state capture and pairwise diffs.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{GraphError, GraphResult};
use crate::metrics::{keys, MetricsRegistry};
use crate::models::GraphSnapshot;
use crate::services::cluster::{ClusterService, ALGORITHM};
use crate::store::SqlStore;

pub struct SnapshotService {
    store: SqlStore,
    clusters: Arc<ClusterService>,
    metrics: Arc<MetricsRegistry>,
}

impl SnapshotService {
    pub fn new(store: SqlStore, clusters: Arc<ClusterService>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            store,
            clusters,
            metrics,
        }
    }

    pub async fn create_snapshot(&self, namespace: &str) -> GraphResult<GraphSnapshot> {
        let node_count = self.store.count_nodes(namespace).await?;
        let edge_count = self.store.count_edges(namespace).await?;
        let modularity = self.clusters.cached_modularity(namespace);

        let memberships = self.store.memberships(namespace, ALGORITHM).await?;
        let mut cluster_sizes: HashMap<String, i64> = HashMap::new();
        for m in memberships {
            *cluster_sizes.entry(m.cluster_id).or_insert(0) += 1;
        }

        let snapshot = GraphSnapshot {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            node_count,
            edge_count,
            modularity,
            metadata: json!({ "cluster_sizes": cluster_sizes }),
            created_at: Utc::now(),
        };
        self.store.insert_snapshot(&snapshot).await?;
        self.metrics.incr(keys::SNAPSHOTS_CREATED, 1);
        Ok(snapshot)
    }

    pub async fn list_snapshots(
        &self,
        namespace: &str,
        limit: i64,
    ) -> GraphResult<Vec<GraphSnapshot>> {
        self.store.list_snapshots(namespace, limit).await
    }

    /// Delta from `a` to `b`: node/edge/modularity differences plus cluster
    /// additions, removals and size changes.
    pub async fn diff_snapshots(&self, a: &str, b: &str) -> GraphResult<Value> {
        let snap_a = self
            .store
            .get_snapshot(a)
            .await?
            .ok_or_else(|| GraphError::NotFound(format!("snapshot {}", a)))?;
        let snap_b = self
            .store
            .get_snapshot(b)
            .await?
            .ok_or_else(|| GraphError::NotFound(format!("snapshot {}", b)))?;

        let sizes_a = cluster_sizes(&snap_a);
        let sizes_b = cluster_sizes(&snap_b);

        let mut added = Map::new();
        let mut removed = Map::new();
        let mut size_delta = Map::new();
        for (cid, size) in &sizes_b {
            match sizes_a.get(cid) {
                None => {
                    added.insert(cid.clone(), Value::from(*size));
                }
                Some(prev) => {
                    let delta = size - prev;
                    if delta != 0 {
                        size_delta.insert(cid.clone(), Value::from(delta));
                    }
                }
            }
        }
        for (cid, size) in &sizes_a {
            if !sizes_b.contains_key(cid) {
                removed.insert(cid.clone(), Value::from(*size));
            }
        }

        Ok(json!({
            "a": snap_a.id,
            "b": snap_b.id,
            "delta_nodes": snap_b.node_count - snap_a.node_count,
            "delta_edges": snap_b.edge_count - snap_a.edge_count,
            "delta_modularity": snap_b.modularity.unwrap_or(0.0) - snap_a.modularity.unwrap_or(0.0),
            "clusters": {
                "added": added,
                "removed": removed,
                "size_delta": size_delta,
            },
        }))
    }
}

fn cluster_sizes(snapshot: &GraphSnapshot) -> HashMap<String, i64> {
    snapshot
        .metadata
        .get("cluster_sizes")
        .and_then(Value::as_object)
        .map(|sizes| {
            sizes
                .iter()
                .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}
