//! External vector index mirroring node embeddings, scoped by namespace.

use qdrant_client::qdrant::{
    value::Kind, vectors_config::Config, Condition, CreateCollection, Distance, Filter,
    PointStruct, SearchPoints, UpsertPointsBuilder, VectorParams, VectorsConfig,
};
use qdrant_client::{Payload, Qdrant};
use sha2::{Digest, Sha256};

use crate::errors::{GraphError, GraphResult};
use crate::models::GraphNode;

const COLLECTION: &str = "graphrag_nodes";

pub struct VectorStoreService {
    client: Qdrant,
}

impl VectorStoreService {
    pub fn new(url: &str) -> GraphResult<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| GraphError::VectorStore(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn ensure_collection(&self, dimension: usize) -> GraphResult<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| GraphError::VectorStore(e.to_string()))?
            .collections;
        if collections.iter().any(|c| c.name == COLLECTION) {
            return Ok(());
        }
        let req = CreateCollection {
            collection_name: COLLECTION.to_string(),
            vectors_config: Some(VectorsConfig {
                config: Some(Config::Params(VectorParams {
                    size: dimension as u64,
                    distance: Distance::Cosine.into(),
                    ..Default::default()
                })),
            }),
            ..Default::default()
        };
        self.client
            .create_collection(req)
            .await
            .map_err(|e| GraphError::VectorStore(e.to_string()))?;
        Ok(())
    }

    /// Mirror embedded nodes; the payload carries what retrieval filters on.
    pub async fn upsert_nodes(&self, nodes: &[GraphNode]) -> GraphResult<()> {
        let embedded: Vec<&GraphNode> = nodes.iter().filter(|n| !n.embedding.is_empty()).collect();
        let Some(first) = embedded.first() else {
            return Ok(());
        };
        self.ensure_collection(first.embedding.len()).await?;
        let points: Vec<PointStruct> = embedded
            .iter()
            .map(|n| {
                let payload: Payload = serde_json::json!({
                    "node_id": n.id,
                    "label": n.label,
                    "namespace": n.namespace,
                    "doc_id": n.prop_str("doc_id"),
                })
                .try_into()
                .unwrap_or_default();
                PointStruct::new(stable_point_id(&n.id), n.embedding.clone(), payload)
            })
            .collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(COLLECTION, points).wait(true))
            .await
            .map_err(|e| GraphError::VectorStore(e.to_string()))?;
        Ok(())
    }

    /// ANN search within a namespace; returns node ids in external rank order.
    pub async fn search(
        &self,
        query_vector: Vec<f32>,
        namespace: &str,
        limit: usize,
    ) -> GraphResult<Vec<String>> {
        let filter = Filter {
            must: vec![Condition::matches("namespace", namespace.to_string())],
            ..Default::default()
        };
        let response = self
            .client
            .search_points(SearchPoints {
                collection_name: COLLECTION.to_string(),
                vector: query_vector,
                limit: limit as u64,
                filter: Some(filter),
                with_payload: Some(true.into()),
                ..Default::default()
            })
            .await
            .map_err(|e| GraphError::VectorStore(e.to_string()))?;
        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                point.payload.get("node_id").and_then(|v| match &v.kind {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })
            })
            .collect())
    }
}

/// Deterministic numeric point id derived from the node id.
pub fn stable_point_id(node_id: &str) -> u64 {
    let digest = Sha256::digest(node_id.as_bytes());
    let hex = hex::encode(&digest[..8]);
    u64::from_str_radix(&hex, 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_point_id_is_deterministic_and_distinct() {
        assert_eq!(stable_point_id("a::chunk::0"), stable_point_id("a::chunk::0"));
        assert_ne!(stable_point_id("a::chunk::0"), stable_point_id("a::chunk::1"));
    }
}
