//! Mode-aware query layer on top of the retriever and imported artifacts.
//!
//! Candidates come from the latest artifact run when present (cached by a
//! filename+mtime version key), otherwise from hybrid retrieval with a 3x
//! expansion. All candidates are rescored by degree, incident relation
//! weight and query-term overlap using mode-specific weights.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::ai::EmbeddingService;
use crate::errors::GraphResult;
use crate::metrics::{keys, MetricsRegistry};
use crate::models::EdgeFilter;
use crate::services::retrieval::{cosine, Retriever};
use crate::store::SqlStore;

const ARTIFACT_ENTITY_CAP: usize = 5_000;
const ARTIFACT_RELATIONSHIP_CAP: usize = 15_000;
const DEGREE_SCAN_CAP: usize = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Auto,
    Global,
    Local,
    Drift,
}

impl QueryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(QueryMode::Auto),
            "global" => Some(QueryMode::Global),
            "local" => Some(QueryMode::Local),
            "drift" => Some(QueryMode::Drift),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Auto => "auto",
            QueryMode::Global => "global",
            QueryMode::Local => "local",
            QueryMode::Drift => "drift",
        }
    }
}

/// Rescoring weights `(centrality, relation, overlap)` per mode.
pub fn mode_weights(mode: QueryMode) -> (f64, f64, f64) {
    match mode {
        QueryMode::Global => (0.45, 0.35, 0.20),
        QueryMode::Local => (0.35, 0.45, 0.20),
        QueryMode::Drift => (0.25, 0.25, 0.50),
        QueryMode::Auto => (0.4, 0.4, 0.2),
    }
}

pub fn relation_weight(relation: &str) -> f64 {
    match relation {
        "ROLE_AT" => 0.9,
        "USES_TECH" => 0.85,
        "CO_OCCURS" => 0.75,
        "RELATED_TO" => 0.6,
        "HAS_ENTITY" => 0.5,
        "CONTAINS" => 0.45,
        "MENTIONED_IN" => 0.4,
        _ => 0.6,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub deg_norm: f64,
    pub rel: f64,
    pub overlap: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredResult {
    pub id: String,
    pub label: String,
    pub name: String,
    pub properties: Value,
    pub score_breakdown: ScoreBreakdown,
    pub aug_score: f64,
}

#[derive(Debug, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    pub mode_used: String,
    pub results: Vec<ScoredResult>,
    pub duration_s: f64,
    pub total_considered: usize,
    pub reasoning_chain: Vec<Value>,
}

#[derive(Debug, Clone)]
struct ArtifactEntity {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct ArtifactRelationship {
    source_id: String,
    target_id: String,
}

#[derive(Default)]
struct ArtifactCache {
    version: String,
    entities: Vec<ArtifactEntity>,
    relationships: Vec<ArtifactRelationship>,
}

struct Candidate {
    id: String,
    label: String,
    name: String,
    properties: Map<String, Value>,
}

pub struct QueryAdapter {
    store: SqlStore,
    retriever: Arc<Retriever>,
    embedder: Arc<EmbeddingService>,
    metrics: Arc<MetricsRegistry>,
    artifacts_dir: PathBuf,
    artifact_cache: Mutex<ArtifactCache>,
    entity_embed_cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl QueryAdapter {
    pub fn new(
        store: SqlStore,
        retriever: Arc<Retriever>,
        embedder: Arc<EmbeddingService>,
        metrics: Arc<MetricsRegistry>,
        artifacts_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            retriever,
            embedder,
            metrics,
            artifacts_dir,
            artifact_cache: Mutex::new(ArtifactCache::default()),
            entity_embed_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn query(
        &self,
        query: &str,
        mode: QueryMode,
        top_k: usize,
        namespace: &str,
    ) -> GraphResult<QueryOutcome> {
        let started = Instant::now();
        let decided = self.decide_mode(query, mode);

        let candidates = match self.artifact_candidates(query, decided, top_k).await {
            Some(cands) if !cands.is_empty() => cands,
            _ => self.retriever_candidates(query, top_k, namespace).await?,
        };
        let total_considered = candidates.len();

        // Relation weight sums over edges incident to the candidate set.
        let cand_ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let mut relation_sums: HashMap<String, f64> = HashMap::new();
        if !cand_ids.is_empty() {
            let edges = self
                .store
                .scan_edges(&EdgeFilter::namespace(namespace).with_touching(cand_ids.clone()))
                .await?;
            for edge in edges {
                let w = relation_weight(&edge.relation);
                if cand_ids.contains(&edge.source_id) {
                    *relation_sums.entry(edge.source_id.clone()).or_insert(0.0) += w;
                }
                if cand_ids.contains(&edge.target_id) {
                    *relation_sums.entry(edge.target_id.clone()).or_insert(0.0) += w;
                }
            }
        }

        let (w_c, w_r, w_o) = mode_weights(decided);
        let query_terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let mut scored: Vec<ScoredResult> = candidates
            .into_iter()
            .map(|c| {
                let deg_norm = c
                    .properties
                    .get("degree_norm")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let rel_sum = relation_sums.get(&c.id).copied().unwrap_or(0.0);
                let overlap = term_overlap(&query_terms, &c.name);
                let length_penalty = if c.name.len() > 80 { 0.05 } else { 0.0 };
                let score =
                    w_c * deg_norm + w_r * ((1.0 + rel_sum).ln() / 4.0) + w_o * overlap - length_penalty;
                ScoredResult {
                    id: c.id,
                    label: c.label,
                    name: c.name,
                    properties: Value::Object(c.properties),
                    score_breakdown: ScoreBreakdown {
                        deg_norm,
                        rel: rel_sum,
                        overlap,
                    },
                    aug_score: round6(score),
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.aug_score
                .partial_cmp(&a.aug_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);

        let duration_s = started.elapsed().as_secs_f64();
        self.metrics.observe_latency(keys::QUERY2_LATENCY, duration_s);
        self.metrics
            .incr(&format!("query2_mode_{}_count", decided.as_str()), 1);

        Ok(QueryOutcome {
            success: true,
            mode_used: decided.as_str().to_string(),
            results: scored,
            duration_s: round4(duration_s),
            total_considered,
            reasoning_chain: vec![
                json!({"step": "mode_selection", "mode": decided.as_str(), "criteria": "len(query) heuristic"}),
                json!({"step": "candidate_scoring", "weights": {"deg_norm": w_c, "relation_sum": w_r, "term_overlap": w_o}}),
            ],
        })
    }

    fn decide_mode(&self, query: &str, mode: QueryMode) -> QueryMode {
        match mode {
            QueryMode::Auto => {
                if query.split_whitespace().count() <= 4 {
                    QueryMode::Global
                } else {
                    QueryMode::Local
                }
            }
            other => other,
        }
    }

    async fn retriever_candidates(
        &self,
        query: &str,
        top_k: usize,
        namespace: &str,
    ) -> GraphResult<Vec<Candidate>> {
        let retrieved = self
            .retriever
            .hybrid_retrieve(query, top_k * 3, namespace, None, None)
            .await?;
        Ok(retrieved
            .nodes
            .into_iter()
            .map(|n| Candidate {
                id: n.id,
                label: n.label,
                name: n.name,
                properties: n.properties,
            })
            .collect())
    }

    /// Structured search over the latest artifact run; None when no
    /// artifacts are importable.
    async fn artifact_candidates(
        &self,
        query: &str,
        mode: QueryMode,
        top_k: usize,
    ) -> Option<Vec<Candidate>> {
        let (entities, relationships) = self.load_artifacts_cached()?;
        if entities.is_empty() {
            return None;
        }

        let mut degree: HashMap<String, usize> = HashMap::new();
        for rel in relationships.iter().take(DEGREE_SCAN_CAP) {
            *degree.entry(rel.source_id.clone()).or_insert(0) += 1;
            *degree.entry(rel.target_id.clone()).or_insert(0) += 1;
        }

        let query_terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let mut prefiltered: Vec<(f64, &ArtifactEntity)> = entities
            .iter()
            .map(|e| (term_overlap(&query_terms, &e.name), e))
            .collect();
        prefiltered.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        prefiltered.truncate(256.max(top_k * 10));

        // Optional embedding similarity with a per-entity cache.
        let mut similarity: HashMap<String, f64> = HashMap::new();
        if self.embedder.is_configured() {
            let query_vec = self.embedder.embed(query).await;
            if !query_vec.is_empty() {
                for (_, entity) in &prefiltered {
                    let cached = self.entity_embed_cache.lock().get(&entity.id).cloned();
                    let vec = match cached {
                        Some(v) => v,
                        None => {
                            let v = self.embedder.embed(&entity.name).await;
                            self.entity_embed_cache
                                .lock()
                                .insert(entity.id.clone(), v.clone());
                            v
                        }
                    };
                    similarity.insert(entity.id.clone(), cosine(&vec, &query_vec));
                }
            }
        }

        let (w_o, w_d, w_s) = match mode {
            QueryMode::Global => (0.4, 0.3, 0.3),
            QueryMode::Local => (0.3, 0.4, 0.3),
            _ => (0.33, 0.34, 0.33),
        };
        let mut scored: Vec<(f64, Candidate)> = prefiltered
            .into_iter()
            .map(|(overlap, entity)| {
                let deg = degree.get(&entity.id).copied().unwrap_or(0);
                let sim = similarity.get(&entity.id).copied().unwrap_or(0.0);
                let score = w_o * overlap + w_d * ((1.0 + deg as f64).ln() / 4.0) + w_s * sim;
                let mut properties = Map::new();
                properties.insert("source".to_string(), Value::from("artifacts"));
                properties.insert("deg".to_string(), Value::from(deg as u64));
                properties.insert("sim".to_string(), Value::from(round4(sim)));
                (
                    score,
                    Candidate {
                        id: entity.id.clone(),
                        label: "Entity".to_string(),
                        name: entity.name.clone(),
                        properties,
                    },
                )
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Some(scored.into_iter().take(top_k * 3).map(|(_, c)| c).collect())
    }

    /// Artifact cache keyed by a filename+mtime composite; a changed run
    /// directory or rewritten file invalidates it.
    fn load_artifacts_cached(&self) -> Option<(Vec<ArtifactEntity>, Vec<ArtifactRelationship>)> {
        let latest = self.latest_run_dir()?;
        let entities_file = find_artifact_file(&latest, "entities")?;
        let relationships_file = find_artifact_file(&latest, "relationships");
        let version = artifact_version(&entities_file, relationships_file.as_deref());

        {
            let cache = self.artifact_cache.lock();
            if cache.version == version && !cache.entities.is_empty() {
                self.metrics.incr(keys::ARTIFACT_CACHE_HITS, 1);
                return Some((cache.entities.clone(), cache.relationships.clone()));
            }
        }
        self.metrics.incr(keys::ARTIFACT_CACHE_MISSES, 1);

        let entities = parse_entities_csv(&entities_file)?;
        let relationships = relationships_file
            .as_deref()
            .and_then(parse_relationships_csv)
            .unwrap_or_default();

        let mut cache = self.artifact_cache.lock();
        cache.version = version;
        cache.entities = entities.clone();
        cache.relationships = relationships.clone();
        self.metrics.incr(keys::ARTIFACT_CACHE_RELOADS, 1);
        Some((entities, relationships))
    }

    fn latest_run_dir(&self) -> Option<PathBuf> {
        let latest = self.artifacts_dir.join("latest");
        if latest.exists() {
            return Some(latest);
        }
        let mut runs: Vec<PathBuf> = std::fs::read_dir(&self.artifacts_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("run-"))
                        .unwrap_or(false)
            })
            .collect();
        runs.sort();
        runs.pop()
    }
}

fn term_overlap(query_terms: &[String], name: &str) -> f64 {
    if query_terms.is_empty() || name.is_empty() {
        return 0.0;
    }
    let name_terms: Vec<String> = name.split_whitespace().map(|t| t.to_lowercase()).collect();
    let hits = query_terms
        .iter()
        .filter(|q| name_terms.iter().any(|n| n == *q))
        .count();
    hits as f64 / query_terms.len() as f64
}

fn artifact_version(entities: &Path, relationships: Option<&Path>) -> String {
    let mut bits = Vec::new();
    for file in [Some(entities), relationships].into_iter().flatten() {
        if let Ok(meta) = std::fs::metadata(file) {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            bits.push(format!("{}{}", name, mtime));
        }
    }
    bits.join("|")
}

fn find_artifact_file(dir: &Path, key: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains(key) && (n.ends_with(".csv") || n.ends_with(".parquet")))
                    .unwrap_or(false)
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

fn parse_entities_csv(path: &Path) -> Option<Vec<ArtifactEntity>> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut out = Vec::new();
    for line in content.lines().skip(1).take(ARTIFACT_ENTITY_CAP) {
        let mut cols = line.splitn(4, ',');
        let id = cols.next()?.trim().to_string();
        let name = cols.next().unwrap_or("").trim().to_string();
        if id.is_empty() {
            continue;
        }
        out.push(ArtifactEntity { id, name });
    }
    Some(out)
}

fn parse_relationships_csv(path: &Path) -> Option<Vec<ArtifactRelationship>> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut out = Vec::new();
    for line in content.lines().skip(1).take(ARTIFACT_RELATIONSHIP_CAP) {
        let cols: Vec<&str> = line.splitn(5, ',').collect();
        if cols.len() < 3 {
            continue;
        }
        let source_id = cols[1].trim().to_string();
        let target_id = cols[2].trim().to_string();
        if source_id.is_empty() || target_id.is_empty() {
            continue;
        }
        out.push(ArtifactRelationship { source_id, target_id });
    }
    Some(out)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_resolves_by_token_count() {
        assert_eq!(mode_weights(QueryMode::Global), (0.45, 0.35, 0.20));
        assert_eq!(mode_weights(QueryMode::Local), (0.35, 0.45, 0.20));
        assert_eq!(mode_weights(QueryMode::Drift), (0.25, 0.25, 0.50));
    }

    #[test]
    fn relation_weights_match_table() {
        assert_eq!(relation_weight("ROLE_AT"), 0.9);
        assert_eq!(relation_weight("MENTIONED_IN"), 0.4);
        assert_eq!(relation_weight("SOMETHING_ELSE"), 0.6);
    }

    #[test]
    fn overlap_is_fraction_of_query_terms() {
        let terms = vec!["rust".to_string(), "engine".to_string()];
        assert_eq!(term_overlap(&terms, "Rust Engine"), 1.0);
        assert_eq!(term_overlap(&terms, "rust compiler"), 0.5);
        assert_eq!(term_overlap(&terms, ""), 0.0);
    }

    #[test]
    fn entities_csv_parses_controlled_dialect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.csv");
        std::fs::write(&path, "entity_id,name,type,description\ne1,Alpha Beta,Entity,desc here\n")
            .unwrap();
        let rows = parse_entities_csv(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "e1");
        assert_eq!(rows[0].name, "Alpha Beta");
    }
}
