//! Hybrid multi-strategy retrieval.
//!
//! The strategy chain short-circuits on the first strategy that yields
//! candidates: external vector index, in-process embedding cosine, name
//! substring, then BM25 over chunk text. `meta.chain` records which
//! strategies contributed to the final set.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::ai::EmbeddingService;
use crate::errors::GraphResult;
use crate::metrics::{keys, MetricsRegistry};
use crate::models::{label, EdgeFilter, GraphEdge, GraphNode, NodeFilter};
use crate::services::vector_store::VectorStoreService;
use crate::store::SqlStore;

const NODE_SCAN_CAP: i64 = 1500;
const CHUNK_SCAN_CAP: i64 = 4000;
const EDGE_FETCH_CAP: i64 = 300;
const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"\w+").unwrap();
}

#[derive(Debug, Default)]
pub struct RetrievedGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub chain: Vec<String>,
}

pub struct Retriever {
    store: SqlStore,
    embedder: Arc<EmbeddingService>,
    vector_store: Option<Arc<VectorStoreService>>,
    metrics: Arc<MetricsRegistry>,
}

impl Retriever {
    pub fn new(
        store: SqlStore,
        embedder: Arc<EmbeddingService>,
        vector_store: Option<Arc<VectorStoreService>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            embedder,
            vector_store,
            metrics,
        }
    }

    pub async fn hybrid_retrieve(
        &self,
        query: &str,
        top_k: usize,
        namespace: &str,
        label_filter: Option<&[String]>,
        relation_filter: Option<&[String]>,
    ) -> GraphResult<RetrievedGraph> {
        self.metrics.incr(keys::RETRIEVAL_REQUESTS, 1);
        let started = Instant::now();

        let mut chain = Vec::new();
        let mut chosen: Vec<GraphNode> = Vec::new();

        // 1. External vector index.
        if let Some(vs) = &self.vector_store {
            if self.embedder.is_configured() {
                match self.vector_search(vs, query, top_k, namespace, label_filter).await {
                    Ok(nodes) if !nodes.is_empty() => {
                        chosen = nodes;
                        chain.push("qdrant".to_string());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("vector index search failed: {}", e),
                }
            }
        }

        // 2. In-process embedding cosine.
        if chosen.is_empty() && self.embedder.is_configured() {
            let candidates = self.namespace_nodes(namespace, label_filter).await?;
            let has_embeds = candidates.iter().any(|n| !n.embedding.is_empty());
            if has_embeds {
                let query_vec = self.embedder.embed(query).await;
                if !query_vec.is_empty() {
                    let mut scored: Vec<(f64, GraphNode)> = candidates
                        .into_iter()
                        .filter(|n| !n.embedding.is_empty())
                        .map(|n| (cosine(&n.embedding, &query_vec), n))
                        .collect();
                    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                    chosen = scored.into_iter().take(top_k).map(|(_, n)| n).collect();
                    if !chosen.is_empty() {
                        chain.push("embedding".to_string());
                    }
                }
            }
        }

        // 3. Name substring.
        if chosen.is_empty() {
            let mut filter = NodeFilter::namespace(namespace)
                .with_name_contains(query)
                .with_limit((top_k * 5) as i64);
            if let Some(labels) = label_filter {
                filter = filter.with_labels(labels.to_vec());
            }
            let hits = self.store.scan_nodes(&filter).await?;
            chosen = hits.into_iter().take(top_k).collect();
            if !chosen.is_empty() {
                chain.push("name_contains".to_string());
            }
        }

        // 4. BM25 over chunk text.
        if chosen.is_empty() {
            chosen = self.bm25_chunks(query, top_k, namespace).await?;
            if !chosen.is_empty() {
                chain.push("bm25".to_string());
            }
        }

        let mut edges = Vec::new();
        if !chosen.is_empty() {
            let ids: Vec<String> = chosen.iter().map(|n| n.id.clone()).collect();
            let fetched = self
                .store
                .scan_edges(
                    &EdgeFilter::namespace(namespace)
                        .with_touching(ids)
                        .with_limit(EDGE_FETCH_CAP),
                )
                .await?;
            edges = match relation_filter {
                Some(relations) => fetched
                    .into_iter()
                    .filter(|e| relations.iter().any(|r| r == &e.relation))
                    .collect(),
                None => fetched,
            };
        }

        self.metrics
            .observe_latency(keys::RETRIEVAL_LATENCY, started.elapsed().as_secs_f64());
        Ok(RetrievedGraph {
            nodes: chosen,
            edges,
            chain,
        })
    }

    async fn vector_search(
        &self,
        vs: &VectorStoreService,
        query: &str,
        top_k: usize,
        namespace: &str,
        label_filter: Option<&[String]>,
    ) -> GraphResult<Vec<GraphNode>> {
        let query_vec = self.embedder.embed(query).await;
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }
        let node_ids = vs.search(query_vec, namespace, top_k * 3).await?;
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut fetched = self
            .store
            .scan_nodes(&NodeFilter::namespace(namespace).with_ids(node_ids.clone()))
            .await?;
        if let Some(labels) = label_filter {
            fetched.retain(|n| labels.iter().any(|l| l == &n.label));
        }
        // Preserve the external rank.
        let rank: HashMap<&str, usize> = node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        fetched.sort_by_key(|n| rank.get(n.id.as_str()).copied().unwrap_or(usize::MAX));
        fetched.truncate(top_k);
        Ok(fetched)
    }

    async fn namespace_nodes(
        &self,
        namespace: &str,
        label_filter: Option<&[String]>,
    ) -> GraphResult<Vec<GraphNode>> {
        let mut filter = NodeFilter::namespace(namespace).with_limit(NODE_SCAN_CAP);
        if let Some(labels) = label_filter {
            filter = filter.with_labels(labels.to_vec());
        }
        self.store.scan_nodes(&filter).await
    }

    async fn bm25_chunks(
        &self,
        query: &str,
        top_k: usize,
        namespace: &str,
    ) -> GraphResult<Vec<GraphNode>> {
        let terms: Vec<String> = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self
            .store
            .scan_nodes(
                &NodeFilter::namespace(namespace)
                    .with_labels(vec![label::CHUNK.to_string()])
                    .with_limit(CHUNK_SCAN_CAP),
            )
            .await?;

        let mut docs: Vec<(GraphNode, Vec<String>)> = Vec::new();
        let mut df: HashMap<String, usize> = HashMap::new();
        for chunk in chunks {
            let text = chunk.prop_str("text").unwrap_or_default().to_string();
            let tokens = tokenize(&text);
            if tokens.is_empty() {
                continue;
            }
            let mut unique: Vec<&String> = tokens.iter().collect();
            unique.sort();
            unique.dedup();
            for t in unique {
                *df.entry(t.clone()).or_insert(0) += 1;
            }
            docs.push((chunk, tokens));
        }
        let n = docs.len().max(1) as f64;
        let avg_dl = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;

        let mut scored: Vec<(f64, GraphNode)> = Vec::new();
        for (chunk, tokens) in docs {
            let dl = tokens.len() as f64;
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for t in &tokens {
                if terms.iter().any(|q| q == t) {
                    *tf.entry(t.as_str()).or_insert(0) += 1;
                }
            }
            if tf.is_empty() {
                continue;
            }
            let mut score = 0.0;
            for (term, count) in tf {
                let df_t = df.get(term).copied().unwrap_or(0) as f64;
                let idf = ((n - df_t + 0.5) / (df_t + 0.5) + 1.0).ln();
                let denom = count as f64 + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_dl.max(1.0));
                score += idf * (count as f64 * (BM25_K1 + 1.0)) / (denom + 1e-9);
            }
            if score > 0.0 {
                scored.push((score, chunk));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(top_k).map(|(_, c)| c).collect())
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|y| (*y as f64).powi(2)).sum::<f64>().sqrt();
    dot / (na.max(1e-9) * nb.max(1e-9))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_empty_and_orthogonal() {
        assert_eq!(cosine(&[], &[1.0]), 0.0);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tokenizer_lowercases_word_chars() {
        assert_eq!(tokenize("Alpha-Beta GAMMA_1"), vec!["alpha", "beta", "gamma_1"]);
    }
}
