use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{GraphEdge, GraphNode};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    pub doc_id: Option<String>,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub force_heuristic: bool,
    #[serde(default)]
    pub disable_embeddings: bool,
    pub namespace: Option<String>,
    /// Recompute layout + centrality after the ingest commits.
    pub compute_layout: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct IngestBatchRequest {
    pub items: Vec<IngestRequest>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub doc_id: String,
    pub namespace: String,
    pub extraction: String,
    pub stats: super::IngestStats,
}

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub namespace: Option<String>,
    pub label_filter: Option<Vec<String>>,
    pub relation_filter: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub nodes: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
    pub meta: RetrievalMeta,
}

#[derive(Debug, Serialize)]
pub struct RetrievalMeta {
    pub strategy: String,
    pub chain: Vec<String>,
}

/// Wire shape of a node: properties flattened to a JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: String,
    pub label: String,
    pub name: String,
    pub properties: Value,
    pub source_ids: Vec<String>,
}

impl From<&GraphNode> for NodeView {
    fn from(n: &GraphNode) -> Self {
        Self {
            id: n.id.clone(),
            label: n.label.clone(),
            name: n.name.clone(),
            properties: Value::Object(n.properties.clone()),
            source_ids: n.source_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub confidence: f64,
}

impl From<&GraphEdge> for EdgeView {
    fn from(e: &GraphEdge) -> Self {
        Self {
            id: e.id.clone(),
            source_id: e.source_id.clone(),
            target_id: e.target_id.clone(),
            relation: e.relation.clone(),
            confidence: e.confidence,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryModeRequest {
    pub query: String,
    pub mode: Option<String>,
    pub top_k: Option<usize>,
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    pub top_k: Option<usize>,
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub context_nodes: Vec<NodeView>,
    pub context_edges: Vec<EdgeView>,
    pub retrieval_meta: RetrievalMeta,
    pub contributing_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PathRequest {
    pub source_id: String,
    pub target_id: String,
    pub max_depth: Option<usize>,
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PathResponse {
    pub path: Vec<String>,
    pub edges: Vec<EdgeView>,
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    pub node_id: String,
    pub top_k: Option<usize>,
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SimilarNode {
    pub id: String,
    pub name: String,
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
pub struct GraphViewQuery {
    pub sample: Option<usize>,
    pub namespace: Option<String>,
    pub label: Option<String>,
    pub relation: Option<String>,
    pub mode: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub wx: Option<f64>,
    pub wy: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub namespace: Option<String>,
    pub label: Option<String>,
    pub relation: Option<String>,
    pub search: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterQuery {
    pub namespace: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    pub namespace: Option<String>,
    pub cluster_ids: Vec<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub namespace: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotDiffQuery {
    pub a: String,
    pub b: String,
}

#[derive(Debug, Deserialize)]
pub struct IndexRunRequest {
    pub namespace: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    /// Forwarded to the external index CLI when one is configured.
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LayoutRequest {
    pub namespace: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}
