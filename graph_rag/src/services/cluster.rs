//! Community detection, caching and budgeted cluster summarization.
//!
//! Louvain runs over the undirected confidence-weighted namespace subgraph
//! with deterministic node ordering. Results are cached in memory under a
//! TTL and persisted as memberships; summaries are cached in the store by a
//! top-terms hash and guarded by a sliding-window rate limit plus a daily
//! token budget per namespace.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::ai::LlmClient;
use crate::errors::GraphResult;
use crate::models::{ClusterMembership, ClusterSummary, EdgeFilter, GraphNode, NodeFilter};
use crate::store::SqlStore;

pub const ALGORITHM: &str = "louvain";
const CACHE_TTL: Duration = Duration::from_secs(600);
const MIN_GROWTH_ABSOLUTE: i64 = 50;
const MIN_GROWTH_RATIO: f64 = 0.1;
const SAMPLE_NODE_CAP: usize = 8;
const TOP_TERM_CAP: usize = 8;
const SUMMARY_SAMPLE_ENTITIES: usize = 6;
const LABEL_MAX: usize = 120;
const SUMMARY_MAX: usize = 800;

#[derive(Debug, Clone, Serialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub id: String,
    pub size: usize,
    pub node_ids: Vec<String>,
    pub sample_nodes: Vec<String>,
    pub centroid: Centroid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub clusters: usize,
    pub nodes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterResult {
    pub clusters: Vec<ClusterInfo>,
    pub stats: ClusterStats,
    pub algorithm: String,
    pub modularity: Option<f64>,
    pub generated_at: f64,
    #[serde(skip)]
    generated_instant: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryEntry {
    pub label: String,
    pub summary: String,
}

pub struct ClusterService {
    store: SqlStore,
    llm: Option<Arc<LlmClient>>,
    daily_token_budget: u32,
    max_tokens_per_summary: u32,
    rate_limit_per_min: u32,
    cache: Mutex<HashMap<String, ClusterResult>>,
    last_counts: Mutex<HashMap<String, i64>>,
    inflight: Mutex<HashSet<String>>,
    tokens_used: Mutex<HashMap<String, u32>>,
    call_windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl ClusterService {
    pub fn new(
        store: SqlStore,
        llm: Option<Arc<LlmClient>>,
        daily_token_budget: u32,
        max_tokens_per_summary: u32,
        rate_limit_per_min: u32,
    ) -> Self {
        Self {
            store,
            llm,
            daily_token_budget,
            max_tokens_per_summary,
            rate_limit_per_min,
            cache: Mutex::new(HashMap::new()),
            last_counts: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            tokens_used: Mutex::new(HashMap::new()),
            call_windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_modularity(&self, namespace: &str) -> Option<f64> {
        self.cache.lock().get(namespace).and_then(|r| r.modularity)
    }

    pub async fn get_clusters(&self, namespace: &str, force: bool) -> GraphResult<ClusterResult> {
        if !force {
            if let Some(cached) = self.cache.lock().get(namespace) {
                let fresh = cached
                    .generated_instant
                    .map(|t| t.elapsed() < CACHE_TTL)
                    .unwrap_or(false);
                if fresh {
                    return Ok(cached.clone());
                }
            }
        }
        self.compute(namespace).await
    }

    async fn compute(&self, namespace: &str) -> GraphResult<ClusterResult> {
        let mut nodes = self
            .store
            .scan_nodes(&NodeFilter::namespace(namespace))
            .await?;
        let edges = self
            .store
            .scan_edges(&EdgeFilter::namespace(namespace))
            .await?;

        if nodes.is_empty() {
            let result = ClusterResult {
                clusters: Vec::new(),
                stats: ClusterStats {
                    clusters: 0,
                    nodes: 0,
                },
                algorithm: ALGORITHM.to_string(),
                modularity: None,
                generated_at: epoch_seconds(),
                generated_instant: Some(Instant::now()),
            };
            self.cache
                .lock()
                .insert(namespace.to_string(), result.clone());
            return Ok(result);
        }

        self.assign_missing_layout(namespace, &mut nodes).await?;

        // Index graph with confidence weights.
        let index_of: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut weighted_edges: Vec<(usize, usize, f64)> = Vec::new();
        for edge in &edges {
            let (Some(&a), Some(&b)) = (
                index_of.get(edge.source_id.as_str()),
                index_of.get(edge.target_id.as_str()),
            ) else {
                continue;
            };
            if a == b {
                continue;
            }
            let weight = if edge.confidence > 0.0 {
                edge.confidence
            } else {
                1.0
            };
            weighted_edges.push((a, b, weight));
        }

        let assignment = louvain_communities(nodes.len(), &weighted_edges);
        let modularity = modularity(nodes.len(), &weighted_edges, &assignment);

        // Group, order by descending size (node id as tiebreak).
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for (node, community) in assignment.iter().enumerate() {
            groups.entry(*community).or_default().push(node);
        }
        let mut ordered: Vec<Vec<usize>> = groups.into_values().collect();
        for group in &mut ordered {
            group.sort_by(|&a, &b| nodes[a].id.cmp(&nodes[b].id));
        }
        ordered.sort_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then_with(|| nodes[a[0]].id.cmp(&nodes[b[0]].id))
        });

        let mut memberships = Vec::new();
        let mut clusters = Vec::new();
        for (i, group) in ordered.iter().enumerate() {
            let cluster_id = format!("c{}", i + 1);
            let node_ids: Vec<String> = group.iter().map(|&n| nodes[n].id.clone()).collect();
            for node_id in &node_ids {
                memberships.push(ClusterMembership {
                    node_id: node_id.clone(),
                    cluster_id: cluster_id.clone(),
                    namespace: namespace.to_string(),
                    algorithm: ALGORITHM.to_string(),
                    score: None,
                });
            }
            let sample_nodes: Vec<String> = group
                .iter()
                .take(SAMPLE_NODE_CAP)
                .map(|&n| nodes[n].name.clone())
                .collect();
            let mut xs = Vec::new();
            let mut ys = Vec::new();
            for &n in group {
                if let Some((x, y)) = nodes[n].layout_xy() {
                    xs.push(x);
                    ys.push(y);
                }
            }
            let centroid = Centroid {
                x: mean(&xs),
                y: mean(&ys),
            };
            clusters.push(ClusterInfo {
                id: cluster_id,
                size: group.len(),
                node_ids,
                sample_nodes,
                centroid,
            });
        }

        self.store
            .replace_memberships(namespace, ALGORITHM, &memberships)
            .await?;

        let result = ClusterResult {
            stats: ClusterStats {
                clusters: clusters.len(),
                nodes: nodes.len(),
            },
            clusters,
            algorithm: ALGORITHM.to_string(),
            modularity,
            generated_at: epoch_seconds(),
            generated_instant: Some(Instant::now()),
        };
        self.cache
            .lock()
            .insert(namespace.to_string(), result.clone());
        self.last_counts
            .lock()
            .insert(namespace.to_string(), nodes.len() as i64);
        info!(
            namespace,
            clusters = result.stats.clusters,
            modularity = ?result.modularity,
            "cluster recompute complete"
        );
        Ok(result)
    }

    /// Nodes without a layout get a deterministic radial position so
    /// centroids stay meaningful.
    async fn assign_missing_layout(
        &self,
        _namespace: &str,
        nodes: &mut [GraphNode],
    ) -> GraphResult<()> {
        if nodes.iter().all(|n| n.layout_xy().is_some()) {
            return Ok(());
        }
        let total = nodes.len().max(1);
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by(|&a, &b| {
            (nodes[a].name.as_str(), nodes[a].id.as_str())
                .cmp(&(nodes[b].name.as_str(), nodes[b].id.as_str()))
        });
        let mut updates = Vec::new();
        for (position, &idx) in order.iter().enumerate() {
            if nodes[idx].layout_xy().is_some() {
                continue;
            }
            let angle = 2.0 * PI * position as f64 / total as f64;
            let mut layout = Map::new();
            layout.insert("x".to_string(), Value::from(round4(0.85 * angle.cos())));
            layout.insert("y".to_string(), Value::from(round4(0.85 * angle.sin())));
            nodes[idx]
                .properties
                .insert("layout".to_string(), Value::Object(layout));
            updates.push((nodes[idx].id.clone(), nodes[idx].properties.clone()));
        }
        if !updates.is_empty() {
            self.store.write_node_properties(&updates).await?;
        }
        Ok(())
    }

    /// Fire-and-forget recompute when the namespace grew past thresholds.
    /// A per-namespace inflight flag prevents concurrent jobs.
    pub fn trigger_background_recompute(self: &Arc<Self>, namespace: &str) {
        let service = Arc::clone(self);
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            if !service.inflight.lock().insert(namespace.clone()) {
                return;
            }
            let outcome = service.maybe_recompute(&namespace).await;
            service.inflight.lock().remove(&namespace);
            if let Err(e) = outcome {
                warn!(namespace = %namespace, "background recompute failed: {}", e);
            }
        });
    }

    async fn maybe_recompute(&self, namespace: &str) -> GraphResult<()> {
        let count = self.store.count_nodes(namespace).await?;
        let previous = self.last_counts.lock().get(namespace).copied();
        let grown = match previous {
            None => true,
            Some(prev) => {
                count - prev >= MIN_GROWTH_ABSOLUTE
                    || (prev > 0 && (count - prev) as f64 / prev as f64 >= MIN_GROWTH_RATIO)
            }
        };
        if grown {
            info!(namespace, count, ?previous, "triggering cluster recompute");
            self.compute(namespace).await?;
        }
        Ok(())
    }

    pub async fn summarize_clusters(
        &self,
        namespace: &str,
        cluster_ids: &[String],
        max_tokens: u32,
    ) -> GraphResult<HashMap<String, SummaryEntry>> {
        // Make sure memberships exist for the namespace.
        self.get_clusters(namespace, false).await?;

        let mut summaries = HashMap::new();
        for cluster_id in cluster_ids {
            if !self.within_rate_limit(namespace) {
                warn!(namespace, cluster_id = %cluster_id, "cluster summarize rate limit hit");
                summaries.insert(
                    cluster_id.clone(),
                    SummaryEntry {
                        label: cluster_id.clone(),
                        summary: "Rate limit exceeded; try later.".to_string(),
                    },
                );
                continue;
            }
            let used = self
                .tokens_used
                .lock()
                .get(namespace)
                .copied()
                .unwrap_or(0);
            if used >= self.daily_token_budget {
                summaries.insert(
                    cluster_id.clone(),
                    SummaryEntry {
                        label: cluster_id.clone(),
                        summary: "Budget exhausted; skipping summary.".to_string(),
                    },
                );
                continue;
            }

            let members = self.cluster_members(namespace, cluster_id).await?;
            if members.is_empty() {
                continue;
            }
            let top_terms = top_terms(&members);
            let top_terms_hash = top_terms.join("|");

            if let Some(existing) = self
                .store
                .find_summary(namespace, cluster_id, ALGORITHM, Some(&top_terms_hash))
                .await?
            {
                summaries.insert(
                    cluster_id.clone(),
                    SummaryEntry {
                        label: existing.label,
                        summary: existing.summary,
                    },
                );
                continue;
            }

            let (label, summary, tokens_spent) = match &self.llm {
                None => (
                    heuristic_label(&top_terms, cluster_id),
                    "LLM disabled; heuristic label derived from frequent terms.".to_string(),
                    0,
                ),
                Some(llm) => {
                    let sample_names: Vec<&str> = members
                        .iter()
                        .map(|m| m.name.as_str())
                        .filter(|n| !n.is_empty())
                        .take(SUMMARY_SAMPLE_ENTITIES)
                        .collect();
                    let prompt = format!(
                        "You are labeling graph clusters. Given TOP_TERMS: {} SAMPLE_ENTITIES: {} \
                         Return JSON with keys label (<12 words) and summary (2 concise sentences).",
                        top_terms.join(", "),
                        sample_names.join(", ")
                    );
                    let mut allowed = max_tokens.min(self.max_tokens_per_summary);
                    if used + allowed > self.daily_token_budget {
                        allowed = self.daily_token_budget.saturating_sub(used);
                    }
                    match llm.summarize_cluster(&prompt, allowed).await {
                        Ok((label, summary)) => (label, summary, allowed),
                        Err(e) => {
                            warn!(cluster_id = %cluster_id, "cluster summarize failed: {}", e);
                            (
                                heuristic_label(&top_terms, cluster_id),
                                "Heuristic fallback summary.".to_string(),
                                0,
                            )
                        }
                    }
                }
            };
            if tokens_spent > 0 {
                *self
                    .tokens_used
                    .lock()
                    .entry(namespace.to_string())
                    .or_insert(0) += tokens_spent;
            }

            let label: String = label.chars().take(LABEL_MAX).collect();
            let summary: String = summary.chars().take(SUMMARY_MAX).collect();
            self.store
                .insert_summary(&ClusterSummary {
                    cluster_id: cluster_id.clone(),
                    namespace: namespace.to_string(),
                    algorithm: ALGORITHM.to_string(),
                    top_terms_hash,
                    label: label.clone(),
                    summary: summary.clone(),
                    token_count: tokens_spent as i64,
                })
                .await?;
            summaries.insert(cluster_id.clone(), SummaryEntry { label, summary });
        }
        Ok(summaries)
    }

    /// Sliding one-minute window; records the call when admitted.
    fn within_rate_limit(&self, namespace: &str) -> bool {
        let mut windows = self.call_windows.lock();
        let calls = windows.entry(namespace.to_string()).or_default();
        let now = Instant::now();
        calls.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if calls.len() >= self.rate_limit_per_min as usize {
            return false;
        }
        calls.push(now);
        true
    }

    async fn cluster_members(
        &self,
        namespace: &str,
        cluster_id: &str,
    ) -> GraphResult<Vec<GraphNode>> {
        let memberships = self.store.memberships(namespace, ALGORITHM).await?;
        let node_ids: Vec<String> = memberships
            .into_iter()
            .filter(|m| m.cluster_id == cluster_id)
            .map(|m| m.node_id)
            .collect();
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .scan_nodes(&NodeFilter::namespace(namespace).with_ids(node_ids))
            .await
    }
}

/// Most frequent alphanumeric name tokens (length 2..=30), capped.
fn top_terms(members: &[GraphNode]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for member in members {
        for word in member.name.split_whitespace() {
            let cleaned: String = word
                .to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect();
            if (2..=30).contains(&cleaned.len()) {
                *counts.entry(cleaned).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(TOP_TERM_CAP)
        .map(|(term, _)| term)
        .collect()
}

fn heuristic_label(top_terms: &[String], cluster_id: &str) -> String {
    let joined = top_terms
        .iter()
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        format!("Cluster {}", cluster_id)
    } else {
        joined
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// ---------------------- Louvain ----------------------

/// Deterministic Louvain: local moving in sorted node order, then graph
/// aggregation, repeated until no community merge happens. Returns a
/// community index per node (compacted, not ordered).
pub fn louvain_communities(node_count: usize, edges: &[(usize, usize, f64)]) -> Vec<usize> {
    if node_count == 0 {
        return Vec::new();
    }
    // Each node starts in the partition induced by the previous level.
    let mut node_to_community: Vec<usize> = (0..node_count).collect();
    let mut level_nodes = node_count;
    let mut level_edges: Vec<(usize, usize, f64)> = edges.to_vec();

    for _ in 0..10 {
        let assignment = one_level(level_nodes, &level_edges);
        let (compact, community_count) = compact_labels(&assignment);
        if community_count == level_nodes {
            break;
        }
        // Project the level assignment onto the original nodes.
        for community in node_to_community.iter_mut() {
            *community = compact[*community];
        }
        // Aggregate: communities become nodes, weights sum.
        let mut aggregated: HashMap<(usize, usize), f64> = HashMap::new();
        for &(a, b, w) in &level_edges {
            let (ca, cb) = (compact[a], compact[b]);
            let key = if ca <= cb { (ca, cb) } else { (cb, ca) };
            *aggregated.entry(key).or_insert(0.0) += w;
        }
        level_nodes = community_count;
        level_edges = aggregated
            .into_iter()
            .map(|((a, b), w)| (a, b, w))
            .collect();
        level_edges.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    }

    compact_labels(&node_to_community).0
}

/// One local-moving phase; returns a community per node.
fn one_level(node_count: usize, edges: &[(usize, usize, f64)]) -> Vec<usize> {
    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); node_count];
    let mut self_loops = vec![0.0f64; node_count];
    let mut total_weight = 0.0f64;
    for &(a, b, w) in edges {
        if a == b {
            self_loops[a] += w;
            total_weight += w;
            continue;
        }
        adjacency[a].push((b, w));
        adjacency[b].push((a, w));
        total_weight += w;
    }
    let m2 = (2.0 * total_weight).max(1e-12);

    let degree: Vec<f64> = (0..node_count)
        .map(|n| adjacency[n].iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self_loops[n])
        .collect();
    let mut community: Vec<usize> = (0..node_count).collect();
    let mut community_total: Vec<f64> = degree.clone();

    for _ in 0..20 {
        let mut moved = false;
        for node in 0..node_count {
            let current = community[node];
            community_total[current] -= degree[node];

            // Weight of links from node into each neighboring community.
            let mut links: HashMap<usize, f64> = HashMap::new();
            links.insert(current, 0.0);
            for &(neighbor, weight) in &adjacency[node] {
                *links.entry(community[neighbor]).or_insert(0.0) += weight;
            }

            let mut best = current;
            let mut best_gain = links.get(&current).copied().unwrap_or(0.0)
                - community_total[current] * degree[node] / m2;
            let mut targets: Vec<(&usize, &f64)> = links.iter().collect();
            targets.sort_by_key(|(c, _)| **c);
            for (&target, &link_weight) in targets {
                let gain = link_weight - community_total[target] * degree[node] / m2;
                if gain > best_gain + 1e-12 {
                    best_gain = gain;
                    best = target;
                }
            }

            community_total[best] += degree[node];
            if best != current {
                community[node] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    community
}

fn compact_labels(assignment: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let mut compact = Vec::with_capacity(assignment.len());
    for &label in assignment {
        let next = mapping.len();
        let id = *mapping.entry(label).or_insert(next);
        compact.push(id);
    }
    (compact, mapping.len())
}

/// Newman modularity of a partition over the weighted undirected graph.
pub fn modularity(
    node_count: usize,
    edges: &[(usize, usize, f64)],
    assignment: &[usize],
) -> Option<f64> {
    if node_count == 0 || edges.is_empty() {
        return None;
    }
    let total: f64 = edges.iter().map(|(_, _, w)| w).sum();
    let m2 = 2.0 * total;
    let mut intra: HashMap<usize, f64> = HashMap::new();
    let mut degree: HashMap<usize, f64> = HashMap::new();
    for &(a, b, w) in edges {
        *degree.entry(assignment[a]).or_insert(0.0) += w;
        *degree.entry(assignment[b]).or_insert(0.0) += w;
        if assignment[a] == assignment[b] {
            *intra.entry(assignment[a]).or_insert(0.0) += w;
        }
    }
    let mut q = 0.0;
    for (community, total_degree) in degree {
        let inside = intra.get(&community).copied().unwrap_or(0.0);
        q += 2.0 * inside / m2 - (total_degree / m2).powi(2);
    }
    Some(q)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cliques() -> (usize, Vec<(usize, usize, f64)>) {
        let mut edges = Vec::new();
        for i in 0..5usize {
            for j in (i + 1)..5 {
                edges.push((i, j, 1.0));
                edges.push((i + 5, j + 5, 1.0));
            }
        }
        (10, edges)
    }

    #[test]
    fn louvain_separates_two_cliques() {
        let (n, edges) = two_cliques();
        let assignment = louvain_communities(n, &edges);
        let first: HashSet<usize> = assignment[..5].iter().copied().collect();
        let second: HashSet<usize> = assignment[5..].iter().copied().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);

        let q = modularity(n, &edges, &assignment).unwrap();
        assert!(q > 0.2, "modularity {} too low", q);
    }

    #[test]
    fn louvain_partition_covers_every_node_exactly_once() {
        let (n, edges) = two_cliques();
        let assignment = louvain_communities(n, &edges);
        assert_eq!(assignment.len(), n);
    }

    #[test]
    fn louvain_is_deterministic() {
        let (n, edges) = two_cliques();
        assert_eq!(
            louvain_communities(n, &edges),
            louvain_communities(n, &edges)
        );
    }

    #[test]
    fn top_terms_ranks_by_frequency() {
        let nodes = vec![
            GraphNode::new("1", "Entity", "alpha beta", "public"),
            GraphNode::new("2", "Entity", "alpha gamma", "public"),
            GraphNode::new("3", "Entity", "alpha", "public"),
        ];
        let terms = top_terms(&nodes);
        assert_eq!(terms[0], "alpha");
        assert!(terms.contains(&"beta".to_string()));
    }

    #[test]
    fn heuristic_label_joins_three_terms() {
        let terms = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        assert_eq!(heuristic_label(&terms, "c1"), "a b c");
        assert_eq!(heuristic_label(&[], "c9"), "Cluster c9");
    }
}
