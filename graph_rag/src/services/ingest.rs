//! Document ingestion: chunking, extraction, idempotent graph upsert,
//! derived edges, ingest log, vector-store sync, events and layout refresh.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::EmbeddingService;
use crate::errors::{GraphError, GraphResult};
use crate::events::{EventBus, GraphEvent};
use crate::metrics::{keys, MetricsRegistry};
use crate::models::requests::IngestRequest;
use crate::models::{
    chunk_node_id, label, relation, section_node_id, EndpointRef, GraphNode, IngestBatch,
    IngestStats, NodeFilter, PendingEdge,
};
use crate::services::chunker::Chunker;
use crate::services::extraction::{ExtractionResult, Extractor};
use crate::services::layout::{LayoutMode, LayoutService};
use crate::services::vector_store::VectorStoreService;
use crate::store::GraphStore;

const MENTION_CHUNK_CAP: usize = 5;
const ROLE_PAIR_CAP: usize = 20;
const TECH_PAIR_CAP: usize = 30;

#[derive(Debug, serde::Serialize)]
pub struct IngestOutcome {
    pub success: bool,
    pub doc_id: String,
    pub namespace: String,
    pub extraction: String,
    pub stats: IngestStats,
}

pub struct Ingestor {
    store: GraphStore,
    extractor: Extractor,
    embedder: Arc<EmbeddingService>,
    vector_store: Option<Arc<VectorStoreService>>,
    layout: LayoutService,
    events: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    default_namespace: String,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: GraphStore,
        extractor: Extractor,
        embedder: Arc<EmbeddingService>,
        vector_store: Option<Arc<VectorStoreService>>,
        layout: LayoutService,
        events: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
        default_namespace: String,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            vector_store,
            layout,
            events,
            metrics,
            default_namespace,
        }
    }

    pub async fn ingest_document(&self, req: IngestRequest) -> GraphResult<IngestOutcome> {
        let started = Instant::now();
        let result = self.ingest_inner(req).await;
        self.metrics
            .observe_latency(keys::INGEST_LATENCY, started.elapsed().as_secs_f64());
        result
    }

    async fn ingest_inner(&self, req: IngestRequest) -> GraphResult<IngestOutcome> {
        let text = req.text.trim().to_string();
        if text.is_empty() {
            return Err(GraphError::InvalidInput("text is empty".to_string()));
        }
        let doc_id = req
            .doc_id
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let namespace = req
            .namespace
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.default_namespace.clone());
        let embeddings_on = !req.disable_embeddings && self.embedder.is_configured();

        let chunk_set = Chunker::split(&text);
        let extraction = self.extractor.extract(&text, req.force_heuristic).await;

        let batch = self
            .build_batch(&doc_id, &namespace, &chunk_set, &extraction, embeddings_on)
            .await;
        let chunk_count = batch.chunks.len();
        let stats = self.store.apply_ingest(batch).await?;

        // Ingest log: content-hash change detection for delta indexing.
        let content_hash = hex::encode(Sha256::digest(text.as_bytes()));
        let meta = req.metadata.clone().unwrap_or_else(|| Value::Object(Map::new()));
        if let Err(e) = self
            .store
            .sql()
            .upsert_ingest_log(&doc_id, &namespace, &content_hash, meta)
            .await
        {
            warn!(doc_id = %doc_id, "ingest log update failed: {}", e);
        }

        self.metrics.incr(keys::INGEST_COUNT, 1);
        self.metrics.incr(keys::NODES_CREATED, stats.nodes as u64);
        self.metrics.incr(keys::EDGES_CREATED, stats.edges as u64);
        self.metrics.incr_namespace_docs(&namespace);

        // Post-commit side effects: vector mirror, stream events, layout.
        if embeddings_on {
            self.sync_vector_store(&doc_id, &namespace).await;
        }
        self.broadcast(&doc_id, chunk_count, stats.edges);
        if req.compute_layout.unwrap_or(true) {
            if let Err(e) = self.layout.recompute_layout(&namespace, LayoutMode::Hybrid).await {
                warn!(namespace = %namespace, "layout recompute failed: {}", e);
            }
            if let Err(e) = self.layout.compute_centrality(&namespace).await {
                warn!(namespace = %namespace, "centrality compute failed: {}", e);
            }
        }

        info!(
            doc_id = %doc_id,
            namespace = %namespace,
            nodes = stats.nodes,
            edges = stats.edges,
            "document ingested"
        );
        Ok(IngestOutcome {
            success: true,
            doc_id,
            namespace,
            extraction: extraction.reasoning,
            stats,
        })
    }

    async fn build_batch(
        &self,
        doc_id: &str,
        namespace: &str,
        chunk_set: &crate::services::chunker::ChunkSet,
        extraction: &ExtractionResult,
        embeddings_on: bool,
    ) -> IngestBatch {
        let mut batch = IngestBatch {
            doc_id: doc_id.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        };

        // Chunk nodes.
        for (idx, chunk_text) in chunk_set.chunks.iter().enumerate() {
            let mut node = GraphNode::new(
                chunk_node_id(doc_id, idx),
                label::CHUNK,
                format!("Chunk {}", idx),
                namespace,
            )
            .with_property("doc_id", Value::from(doc_id))
            .with_property("chunk_index", Value::from(idx as u64))
            .with_property("text", Value::from(chunk_text.clone()))
            .with_source(doc_id);
            if let Some(meta) = chunk_set.sections.get(idx) {
                node = node
                    .with_property("section_id", Value::from(meta.section_id.clone()))
                    .with_property("section_title", Value::from(meta.section_title.clone()))
                    .with_property("section_local_index", Value::from(meta.local_index as u64));
            }
            if embeddings_on {
                node.embedding = self.embedder.embed(chunk_text).await;
            }
            batch.chunks.push(node);
        }

        // Entity nodes, keyed by name for dedup inside the transaction.
        let mut entity_id_to_name: HashMap<String, String> = HashMap::new();
        let mut name_to_label: HashMap<String, String> = HashMap::new();
        for entity in &extraction.nodes {
            if entity.name.trim().is_empty() {
                continue;
            }
            entity_id_to_name.insert(entity.id.clone(), entity.name.clone());
            name_to_label.insert(entity.name.clone(), entity.label.clone());
            let mut node = GraphNode::new(
                Uuid::new_v4().to_string(),
                &entity.label,
                entity.name.clone(),
                namespace,
            )
            .with_source(doc_id);
            for (k, v) in &entity.properties {
                node.properties.insert(k.clone(), v.clone());
            }
            node.properties
                .insert("namespace".to_string(), Value::from(namespace));
            if embeddings_on {
                node.embedding = self.embedder.embed(&entity.name).await;
            }
            batch.entities.push(node);
        }

        // Extraction edges, endpoints resolved by entity name.
        for edge in &extraction.edges {
            let (Some(source), Some(target)) = (
                entity_id_to_name.get(&edge.source_id),
                entity_id_to_name.get(&edge.target_id),
            ) else {
                continue;
            };
            batch.edges.push(PendingEdge {
                source: EndpointRef::Entity(source.clone()),
                target: EndpointRef::Entity(target.clone()),
                relation: edge.relation.clone(),
                confidence: edge.confidence,
            });
        }

        // Section nodes and CONTAINS edges.
        let mut section_seen: HashSet<String> = HashSet::new();
        for meta in &chunk_set.sections {
            if section_seen.insert(meta.section_id.clone()) {
                let title: String = meta.section_title.chars().take(100).collect();
                let node = GraphNode::new(
                    section_node_id(doc_id, &meta.section_id),
                    label::SECTION,
                    title,
                    namespace,
                )
                .with_property("doc_id", Value::from(doc_id))
                .with_property("section_id", Value::from(meta.section_id.clone()))
                .with_property("title", Value::from(meta.section_title.clone()))
                .with_source(doc_id);
                batch.sections.push(node);
            }
        }
        for (idx, meta) in chunk_set.sections.iter().enumerate() {
            batch.edges.push(PendingEdge {
                source: EndpointRef::Node(section_node_id(doc_id, &meta.section_id)),
                target: EndpointRef::Node(chunk_node_id(doc_id, idx)),
                relation: relation::CONTAINS.to_string(),
                confidence: 0.9,
            });
        }

        // Mention detection: case-insensitive substring per chunk, capped.
        let lowered_chunks: Vec<String> =
            chunk_set.chunks.iter().map(|c| c.to_lowercase()).collect();
        let mut chunk_entities: HashMap<usize, Vec<String>> = HashMap::new();
        for name in name_to_label.keys() {
            let lname = name.to_lowercase();
            if lname.is_empty() {
                continue;
            }
            let mut hits = 0;
            for (idx, chunk) in lowered_chunks.iter().enumerate() {
                if chunk.contains(&lname) {
                    chunk_entities.entry(idx).or_default().push(name.clone());
                    batch.edges.push(PendingEdge {
                        source: EndpointRef::Entity(name.clone()),
                        target: EndpointRef::Node(chunk_node_id(doc_id, idx)),
                        relation: relation::MENTIONED_IN.to_string(),
                        confidence: 0.6,
                    });
                    hits += 1;
                    if hits >= MENTION_CHUNK_CAP {
                        break;
                    }
                }
            }
        }

        // Co-occurrence: once per unordered entity pair per document.
        let mut co_pairs: HashSet<(String, String)> = HashSet::new();
        let mut chunk_indices: Vec<&usize> = chunk_entities.keys().collect();
        chunk_indices.sort();
        for idx in &chunk_indices {
            let names = &chunk_entities[*idx];
            for i in 0..names.len() {
                for j in (i + 1)..names.len() {
                    let (a, b) = ordered_pair(&names[i], &names[j]);
                    if a == b || !co_pairs.insert((a.clone(), b.clone())) {
                        continue;
                    }
                    batch.edges.push(PendingEdge {
                        source: EndpointRef::Entity(a),
                        target: EndpointRef::Entity(b),
                        relation: relation::CO_OCCURS.to_string(),
                        confidence: 0.55,
                    });
                }
            }
        }

        // Section -> entity evidence edges.
        if !chunk_set.sections.is_empty() {
            let mut section_entities: HashMap<String, Vec<String>> = HashMap::new();
            for (idx, names) in &chunk_entities {
                if let Some(meta) = chunk_set.sections.get(*idx) {
                    let bucket = section_entities.entry(meta.section_id.clone()).or_default();
                    for name in names {
                        if !bucket.contains(name) {
                            bucket.push(name.clone());
                        }
                    }
                }
            }
            for (section_id, names) in section_entities {
                for name in names {
                    batch.edges.push(PendingEdge {
                        source: EndpointRef::Node(section_node_id(doc_id, &section_id)),
                        target: EndpointRef::Entity(name),
                        relation: relation::HAS_ENTITY.to_string(),
                        confidence: 0.5,
                    });
                }
            }
        }

        // Derived domain edges from chunk-level label co-occurrence.
        let mut rel_seen: HashSet<(String, String, &'static str)> = HashSet::new();
        for idx in &chunk_indices {
            let names = &chunk_entities[*idx];
            let roles: Vec<&String> = names
                .iter()
                .filter(|n| name_to_label.get(*n).map(String::as_str) == Some(label::ROLE))
                .collect();
            let orgs: Vec<&String> = names
                .iter()
                .filter(|n| name_to_label.get(*n).map(String::as_str) == Some(label::ORGANIZATION))
                .collect();
            let techs: Vec<&String> = names
                .iter()
                .filter(|n| name_to_label.get(*n).map(String::as_str) == Some(label::TECHNOLOGY))
                .collect();
            for role in roles.iter().take(ROLE_PAIR_CAP) {
                for org in orgs.iter().take(ROLE_PAIR_CAP) {
                    let (a, b) = ordered_pair(role.as_str(), org.as_str());
                    if !rel_seen.insert((a, b, relation::ROLE_AT)) {
                        continue;
                    }
                    batch.edges.push(PendingEdge {
                        source: EndpointRef::Entity((*role).clone()),
                        target: EndpointRef::Entity((*org).clone()),
                        relation: relation::ROLE_AT.to_string(),
                        confidence: 0.65,
                    });
                }
            }
            for holder in roles.iter().chain(orgs.iter()) {
                for tech in techs.iter().take(TECH_PAIR_CAP) {
                    let (a, b) = ordered_pair(holder.as_str(), tech.as_str());
                    if !rel_seen.insert((a, b, relation::USES_TECH)) {
                        continue;
                    }
                    batch.edges.push(PendingEdge {
                        source: EndpointRef::Entity((*holder).clone()),
                        target: EndpointRef::Entity((*tech).clone()),
                        relation: relation::USES_TECH.to_string(),
                        confidence: 0.55,
                    });
                }
            }
        }

        batch
    }

    /// Mirror this document's embedded nodes into the external vector index.
    async fn sync_vector_store(&self, doc_id: &str, namespace: &str) {
        let Some(vs) = &self.vector_store else {
            return;
        };
        let nodes = match self
            .store
            .sql()
            .scan_nodes(&NodeFilter::namespace(namespace))
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("vector sync scan failed: {}", e);
                return;
            }
        };
        let doc_nodes: Vec<GraphNode> = nodes
            .into_iter()
            .filter(|n| {
                !n.embedding.is_empty()
                    && (n.source_ids.iter().any(|s| s == doc_id) || n.id.starts_with(doc_id))
            })
            .collect();
        if doc_nodes.is_empty() {
            return;
        }
        if let Err(e) = vs.upsert_nodes(&doc_nodes).await {
            warn!(doc_id = %doc_id, "vector store upsert failed: {}", e);
        }
    }

    fn broadcast(&self, doc_id: &str, chunk_count: usize, edges_created: usize) {
        let mut events = Vec::new();
        for idx in 0..chunk_count {
            events.push(GraphEvent::new(
                "node_added",
                json!({
                    "id": chunk_node_id(doc_id, idx),
                    "label": label::CHUNK,
                    "name": format!("Chunk {}", idx),
                }),
            ));
        }
        if edges_created > 0 {
            events.push(GraphEvent::new(
                "edges_added",
                json!({ "count": edges_created, "doc_id": doc_id }),
            ));
        }
        self.events.publish_all(events);
    }
}

fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}
