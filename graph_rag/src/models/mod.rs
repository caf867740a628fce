pub mod requests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical relation names. The relation column is an open enum: extraction
/// may produce arbitrary uppercase relations, these are the ones the engine
/// itself emits or weighs.
pub mod relation {
    pub const RELATED_TO: &str = "RELATED_TO";
    pub const MENTIONED_IN: &str = "MENTIONED_IN";
    pub const CONTAINS: &str = "CONTAINS";
    pub const HAS_ENTITY: &str = "HAS_ENTITY";
    pub const CO_OCCURS: &str = "CO_OCCURS";
    pub const ROLE_AT: &str = "ROLE_AT";
    pub const USES_TECH: &str = "USES_TECH";
    pub const LINKS: &str = "LINKS";
}

/// Canonical node labels. Open enum as well; the classifier refines
/// `Entity` into the more specific variants.
pub mod label {
    pub const ENTITY: &str = "Entity";
    pub const CHUNK: &str = "Chunk";
    pub const SECTION: &str = "Section";
    pub const TECHNOLOGY: &str = "Technology";
    pub const ORGANIZATION: &str = "Organization";
    pub const ROLE: &str = "Role";
    pub const ACHIEVEMENT: &str = "Achievement";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub name: String,
    pub properties: Map<String, Value>,
    pub source_ids: Vec<String>,
    /// Empty when no embedding has been computed.
    pub embedding: Vec<f32>,
    pub namespace: String,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, label: &str, name: impl Into<String>, namespace: &str) -> Self {
        let mut properties = Map::new();
        properties.insert("namespace".to_string(), Value::String(namespace.to_string()));
        Self {
            id: id.into(),
            label: label.to_string(),
            name: name.into(),
            properties,
            source_ids: Vec::new(),
            embedding: Vec::new(),
            namespace: namespace.to_string(),
        }
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn with_source(mut self, doc_id: &str) -> Self {
        self.source_ids.push(doc_id.to_string());
        self
    }

    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Stored layout position, when a layout pass has run.
    pub fn layout_xy(&self) -> Option<(f64, f64)> {
        let layout = self.properties.get("layout")?.as_object()?;
        Some((layout.get("x")?.as_f64()?, layout.get("y")?.as_f64()?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub confidence: f64,
    pub properties: Map<String, Value>,
    pub namespace: String,
}

impl GraphEdge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: &str,
        confidence: f64,
        namespace: &str,
    ) -> Self {
        let mut properties = Map::new();
        properties.insert("namespace".to_string(), Value::String(namespace.to_string()));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation: relation.to_string(),
            confidence,
            properties,
            namespace: namespace.to_string(),
        }
    }
}

/// Stable id for the chunk at `index` of a document.
pub fn chunk_node_id(doc_id: &str, index: usize) -> String {
    format!("{}::chunk::{}", doc_id, index)
}

/// Stable id for the section with slug `slug` of a document.
pub fn section_node_id(doc_id: &str, slug: &str) -> String {
    format!("{}::section::{}", doc_id, slug)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub node_id: String,
    pub cluster_id: String,
    pub namespace: String,
    pub algorithm: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub namespace: String,
    pub algorithm: String,
    pub top_terms_hash: String,
    pub label: String,
    pub summary: String,
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub id: String,
    pub namespace: String,
    pub node_count: i64,
    pub edge_count: i64,
    pub modularity: Option<f64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Ingested,
    Stale,
    Indexed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Ingested => "ingested",
            IngestStatus::Stale => "stale",
            IngestStatus::Indexed => "indexed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "stale" => IngestStatus::Stale,
            "indexed" => IngestStatus::Indexed,
            _ => IngestStatus::Ingested,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestLogEntry {
    pub doc_id: String,
    pub namespace: String,
    pub content_hash: String,
    pub status: IngestStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_ingest_at: DateTime<Utc>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub meta: Value,
}

/// Node scan filter. Every field is conjunctive; `None` means unconstrained.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub namespace: Option<String>,
    pub labels: Option<Vec<String>>,
    pub ids: Option<Vec<String>>,
    pub name_contains: Option<String>,
    pub limit: Option<i64>,
}

impl NodeFilter {
    pub fn namespace(ns: &str) -> Self {
        Self {
            namespace: Some(ns.to_string()),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_name_contains(mut self, needle: &str) -> Self {
        self.name_contains = Some(needle.to_string());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub namespace: Option<String>,
    pub relations: Option<Vec<String>>,
    /// Keep edges where either endpoint is in this set.
    pub touching: Option<Vec<String>>,
    pub limit: Option<i64>,
}

impl EdgeFilter {
    pub fn namespace(ns: &str) -> Self {
        Self {
            namespace: Some(ns.to_string()),
            ..Default::default()
        }
    }

    pub fn with_relations(mut self, relations: Vec<String>) -> Self {
        self.relations = Some(relations);
        self
    }

    pub fn with_touching(mut self, ids: Vec<String>) -> Self {
        self.touching = Some(ids);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One ingest call's full write set, applied in a single transaction.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub doc_id: String,
    pub namespace: String,
    pub chunks: Vec<GraphNode>,
    pub sections: Vec<GraphNode>,
    /// Candidate entity nodes; merged into existing rows on a
    /// `(lower(name), namespace)` hit.
    pub entities: Vec<GraphNode>,
    pub edges: Vec<PendingEdge>,
}

/// Edge endpoint that may still need resolution against the canonical
/// entity table inside the ingest transaction.
#[derive(Debug, Clone)]
pub enum EndpointRef {
    /// A concrete node id (chunk, section, or already-canonical entity).
    Node(String),
    /// An entity referenced by name; resolved to its canonical id.
    Entity(String),
}

#[derive(Debug, Clone)]
pub struct PendingEdge {
    pub source: EndpointRef,
    pub target: EndpointRef,
    pub relation: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub nodes: usize,
    pub edges: usize,
    pub entities_merged: usize,
    pub store: String,
}
