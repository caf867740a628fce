//! Optional property-graph backend.
//!
//! The relational store stays authoritative for reads and system tables;
//! this client mirrors node/edge writes into Neo4j and offers a native
//! shortest-path primitive that the pathfinder probes for.

use neo4rs::{query, ConfigBuilder, Graph};
use std::sync::Arc;
use tracing::info;

use crate::errors::{GraphError, GraphResult};
use crate::models::{GraphEdge, GraphNode};

pub struct Neo4jMirror {
    graph: Arc<Graph>,
    uri: String,
}

impl Neo4jMirror {
    /// Connect to a local Neo4j (`bolt://...`) or AuraDB (`neo4j+s://...`).
    pub async fn new(uri: &str, user: &str, password: &str) -> GraphResult<Self> {
        info!("Connecting to Neo4j at {}", uri);
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db("neo4j")
            .fetch_size(500)
            .max_connections(10)
            .build()
            .map_err(|e| GraphError::GraphBackend(format!("Failed to build Neo4j config: {}", e)))?;

        let graph = Graph::connect(config)
            .await
            .map_err(|e| GraphError::GraphBackend(format!("Failed to connect to Neo4j: {}", e)))?;

        // Probe the connection before accepting it.
        let mut result = graph
            .execute(query("RETURN 1 as test"))
            .await
            .map_err(|e| GraphError::GraphBackend(format!("Connection test failed: {}", e)))?;
        result
            .next()
            .await
            .map_err(|e| GraphError::GraphBackend(e.to_string()))?;
        info!("Neo4j connection established");

        Ok(Self {
            graph: Arc::new(graph),
            uri: uri.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn upsert_nodes(&self, nodes: &[GraphNode]) -> GraphResult<()> {
        for node in nodes {
            self.graph
                .run(
                    query(
                        "MERGE (n:GraphNode {id: $id})
                         SET n.name = $name, n.label = $label, n.namespace = $namespace",
                    )
                    .param("id", node.id.as_str())
                    .param("name", node.name.as_str())
                    .param("label", node.label.as_str())
                    .param("namespace", node.namespace.as_str()),
                )
                .await
                .map_err(|e| GraphError::GraphBackend(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn upsert_edges(&self, edges: &[GraphEdge]) -> GraphResult<()> {
        for edge in edges {
            self.graph
                .run(
                    query(
                        "MATCH (s:GraphNode {id: $source_id})
                         MATCH (t:GraphNode {id: $target_id})
                         MERGE (s)-[r:REL {id: $id}]->(t)
                         SET r.relation = $relation, r.confidence = $confidence, r.namespace = $namespace",
                    )
                    .param("id", edge.id.as_str())
                    .param("source_id", edge.source_id.as_str())
                    .param("target_id", edge.target_id.as_str())
                    .param("relation", edge.relation.as_str())
                    .param("confidence", edge.confidence)
                    .param("namespace", edge.namespace.as_str()),
                )
                .await
                .map_err(|e| GraphError::GraphBackend(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn delete_doc_scoped(&self, doc_id: &str) -> GraphResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (n:GraphNode)
                     WHERE n.id STARTS WITH $chunk_prefix OR n.id STARTS WITH $section_prefix
                     DETACH DELETE n",
                )
                .param("chunk_prefix", format!("{}::chunk::", doc_id))
                .param("section_prefix", format!("{}::section::", doc_id)),
            )
            .await
            .map_err(|e| GraphError::GraphBackend(e.to_string()))?;
        Ok(())
    }

    /// Native shortest path within the namespace, bounded by `max_depth` hops.
    pub async fn shortest_path(
        &self,
        source_id: &str,
        target_id: &str,
        max_depth: usize,
        namespace: &str,
    ) -> GraphResult<Vec<String>> {
        // Variable-length bounds cannot be parameterized in Cypher; the depth
        // is an integer under our control.
        let cypher = format!(
            "MATCH (a:GraphNode {{id: $source, namespace: $ns}}),
                   (b:GraphNode {{id: $target, namespace: $ns}}),
                   p = shortestPath((a)-[*..{}]-(b))
             RETURN p",
            max_depth
        );
        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("source", source_id)
                    .param("target", target_id)
                    .param("ns", namespace),
            )
            .await
            .map_err(|e| GraphError::GraphBackend(e.to_string()))?;

        if let Some(row) = result
            .next()
            .await
            .map_err(|e| GraphError::GraphBackend(e.to_string()))?
        {
            if let Ok(path) = row.get::<neo4rs::Path>("p") {
                let ids: Vec<String> = path
                    .nodes()
                    .iter()
                    .filter_map(|n| n.get::<String>("id").ok())
                    .collect();
                if !ids.is_empty() {
                    return Ok(ids);
                }
            }
        }
        Ok(Vec::new())
    }
}
