//! Graph persistence: a relational SQL store, optionally paired with a
//! property-graph mirror.

mod neo4j;
mod sql;

pub use neo4j::Neo4jMirror;
pub use sql::SqlStore;

use std::sync::Arc;
use tracing::warn;

use crate::errors::GraphResult;
use crate::models::{GraphEdge, GraphNode, IngestBatch, IngestStats};

/// Tagged backend variant. The relational store is always present and stays
/// authoritative for scans and system tables; the graph-native variant
/// mirrors node/edge writes and exposes a native shortest-path capability.
#[derive(Clone)]
pub struct GraphStore {
    sql: SqlStore,
    mirror: Option<Arc<Neo4jMirror>>,
}

impl GraphStore {
    pub fn relational(sql: SqlStore) -> Self {
        Self { sql, mirror: None }
    }

    pub fn graph_native(sql: SqlStore, mirror: Arc<Neo4jMirror>) -> Self {
        Self {
            sql,
            mirror: Some(mirror),
        }
    }

    pub fn sql(&self) -> &SqlStore {
        &self.sql
    }

    /// Native shortest-path capability, present on graph-native backends.
    pub fn native(&self) -> Option<&Neo4jMirror> {
        self.mirror.as_deref()
    }

    pub fn backend_name(&self) -> &'static str {
        if self.mirror.is_some() {
            "graph-native"
        } else {
            "relational"
        }
    }

    /// Apply an ingest batch transactionally, then mirror best-effort.
    /// Mirror failures never fail the ingest.
    pub async fn apply_ingest(&self, batch: IngestBatch) -> GraphResult<IngestStats> {
        let doc_id = batch.doc_id.clone();
        let namespace = batch.namespace.clone();
        let mut stats = self.sql.apply_ingest(batch).await?;
        if let Some(mirror) = &self.mirror {
            stats.store = "graph-native".to_string();
            if let Err(e) = self.mirror_doc(mirror, &doc_id, &namespace).await {
                warn!(doc_id = %doc_id, "graph mirror sync failed: {}", e);
            }
        }
        Ok(stats)
    }

    async fn mirror_doc(
        &self,
        mirror: &Neo4jMirror,
        doc_id: &str,
        namespace: &str,
    ) -> GraphResult<()> {
        mirror.delete_doc_scoped(doc_id).await?;
        let filter = crate::models::NodeFilter::namespace(namespace);
        let nodes: Vec<GraphNode> = self
            .sql
            .scan_nodes(&filter)
            .await?
            .into_iter()
            .filter(|n| n.source_ids.iter().any(|s| s == doc_id) || n.id.starts_with(doc_id))
            .collect();
        mirror.upsert_nodes(&nodes).await?;
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let edges: Vec<GraphEdge> = self
            .sql
            .scan_edges(&crate::models::EdgeFilter::namespace(namespace).with_touching(ids))
            .await?;
        mirror.upsert_edges(&edges).await?;
        Ok(())
    }
}
