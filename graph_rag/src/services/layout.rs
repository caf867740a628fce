//! Deterministic 2D layout and centrality over the namespace subgraph.
//!
//! Layout runs a seeded spring relaxation from structured anchors: section
//! nodes sit on a ring, everything else starts near its section (or on a
//! small hash-derived circle). Centrality covers PageRank and exact or
//! pivot-sampled betweenness, min-max normalized into node properties.

use petgraph::graph::{NodeIndex, UnGraph};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

use crate::errors::GraphResult;
use crate::models::{label, EdgeFilter, GraphNode, NodeFilter};
use crate::store::SqlStore;

const SPRING_ITERATIONS: usize = 40;
const CLUSTER_SPRING_ITERATIONS: usize = 35;
const SPRING_NODE_CAP: usize = 3000;
const PAGERANK_NODE_CAP: usize = 5000;
const BETWEENNESS_EXACT_CAP: usize = 1200;
const BETWEENNESS_SAMPLED_CAP: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    Hybrid,
    Clustered,
}

impl LayoutMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "clustered" => LayoutMode::Clustered,
            _ => LayoutMode::Hybrid,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct LayoutOutcome {
    pub success: bool,
    pub mode: String,
    pub nodes: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct CentralityOutcome {
    pub success: bool,
    pub nodes_updated: usize,
    pub have_pagerank: bool,
    pub have_betweenness: bool,
}

#[derive(Clone)]
pub struct LayoutService {
    store: SqlStore,
}

struct NamespaceGraph {
    nodes: Vec<GraphNode>,
    graph: UnGraph<(), f64>,
    index_of: HashMap<String, NodeIndex>,
}

impl LayoutService {
    pub fn new(store: SqlStore) -> Self {
        Self { store }
    }

    async fn load(&self, namespace: &str) -> GraphResult<NamespaceGraph> {
        let nodes = self
            .store
            .scan_nodes(&NodeFilter::namespace(namespace))
            .await?;
        let edges = self
            .store
            .scan_edges(&EdgeFilter::namespace(namespace))
            .await?;
        let mut graph = UnGraph::<(), f64>::default();
        let mut index_of = HashMap::new();
        for node in &nodes {
            let idx = graph.add_node(());
            index_of.insert(node.id.clone(), idx);
        }
        for edge in &edges {
            if let (Some(&a), Some(&b)) = (index_of.get(&edge.source_id), index_of.get(&edge.target_id)) {
                if a != b {
                    graph.add_edge(a, b, edge.confidence);
                }
            }
        }
        Ok(NamespaceGraph {
            nodes,
            graph,
            index_of,
        })
    }

    pub async fn recompute_layout(
        &self,
        namespace: &str,
        mode: LayoutMode,
    ) -> GraphResult<LayoutOutcome> {
        match mode {
            LayoutMode::Hybrid => self.hybrid_layout(namespace).await,
            LayoutMode::Clustered => self.clustered_layout(namespace).await,
        }
    }

    async fn hybrid_layout(&self, namespace: &str) -> GraphResult<LayoutOutcome> {
        let ng = self.load(namespace).await?;
        if ng.nodes.is_empty() {
            return Ok(LayoutOutcome {
                success: false,
                mode: "hybrid".to_string(),
                nodes: 0,
            });
        }

        // Section ring.
        let mut sections: Vec<&GraphNode> =
            ng.nodes.iter().filter(|n| n.label == label::SECTION).collect();
        sections.sort_by(|a, b| a.id.cmp(&b.id));
        let mut section_pos: HashMap<String, (f64, f64)> = HashMap::new();
        if !sections.is_empty() {
            let radius = 1.0 + ((sections.len() + 1) as f64).ln() * 0.2;
            for (i, s) in sections.iter().enumerate() {
                let angle = 2.0 * PI * i as f64 / sections.len().max(1) as f64;
                section_pos.insert(s.id.clone(), (radius * angle.cos(), radius * angle.sin()));
            }
        }

        // Anchors: section position + hash jitter, or a small hash circle.
        let mut positions: HashMap<String, (f64, f64)> = HashMap::new();
        for node in &ng.nodes {
            if let Some(&p) = section_pos.get(&node.id) {
                positions.insert(node.id.clone(), p);
                continue;
            }
            let anchor = node
                .prop_str("section_id")
                .map(|sid| {
                    let doc = node.prop_str("doc_id").unwrap_or("doc");
                    crate::models::section_node_id(doc, sid)
                })
                .and_then(|sec_node| section_pos.get(&sec_node).copied());
            let p = match anchor {
                Some((ax, ay)) => {
                    let theta = (hash_of(&node.id) % 100) as f64 / 100.0 * 2.0 * PI;
                    (ax + theta.sin() * 0.15, ay + theta.cos() * 0.15)
                }
                None => {
                    let theta = (hash_of(&node.id) % 360) as f64 / 180.0 * PI;
                    (theta.cos() * 0.5, theta.sin() * 0.5)
                }
            };
            positions.insert(node.id.clone(), p);
        }

        if ng.nodes.len() <= SPRING_NODE_CAP {
            let k = 0.6 / (ng.nodes.len().max(1) as f64).sqrt();
            spring_relax(&ng, &mut positions, k, SPRING_ITERATIONS, None);
        }

        let count = self.write_positions(&ng, &positions).await?;
        debug!(namespace, nodes = count, "hybrid layout written");
        Ok(LayoutOutcome {
            success: true,
            mode: "hybrid".to_string(),
            nodes: count,
        })
    }

    async fn clustered_layout(&self, namespace: &str) -> GraphResult<LayoutOutcome> {
        let memberships = self.store.memberships(namespace, "louvain").await?;
        if memberships.is_empty() {
            // No communities yet; hybrid is the defined fallback.
            let mut outcome = self.hybrid_layout(namespace).await?;
            outcome.mode = "hybrid-fallback".to_string();
            return Ok(outcome);
        }
        let ng = self.load(namespace).await?;
        if ng.nodes.is_empty() {
            return Ok(LayoutOutcome {
                success: false,
                mode: "clustered".to_string(),
                nodes: 0,
            });
        }

        let mut cluster_map: HashMap<String, Vec<String>> = HashMap::new();
        for m in &memberships {
            cluster_map
                .entry(m.cluster_id.clone())
                .or_default()
                .push(m.node_id.clone());
        }
        let mut cluster_ids: Vec<String> = cluster_map.keys().cloned().collect();
        cluster_ids.sort();

        let ring = 4.0 + ((cluster_ids.len() + 1) as f64).ln();
        let mut positions: HashMap<String, (f64, f64)> = HashMap::new();
        for (i, cid) in cluster_ids.iter().enumerate() {
            let angle = 2.0 * PI * i as f64 / cluster_ids.len() as f64;
            let center = (ring * angle.cos(), ring * angle.sin());
            let members = &cluster_map[cid];
            if members.len() == 1 {
                positions.insert(members[0].clone(), center);
                continue;
            }
            // Local spring on the induced subgraph, then translate + scale.
            let mut local: HashMap<String, (f64, f64)> = HashMap::new();
            for (j, id) in members.iter().enumerate() {
                let theta = 2.0 * PI * j as f64 / members.len() as f64;
                local.insert(id.clone(), (theta.cos(), theta.sin()));
            }
            let k = 0.4 / (members.len() as f64).sqrt();
            let member_set: std::collections::HashSet<&String> = members.iter().collect();
            spring_relax(
                &ng,
                &mut local,
                k,
                CLUSTER_SPRING_ITERATIONS,
                Some(&member_set),
            );
            let scale = 1.2 + ((members.len() + 1) as f64).ln() * 0.15;
            for (id, (x, y)) in local {
                positions.insert(id, (center.0 + x * scale, center.1 + y * scale));
            }
        }

        // Nodes outside any cluster keep a spot near the origin.
        for node in &ng.nodes {
            if !positions.contains_key(&node.id) {
                let theta = (hash_of(&node.id) % 360) as f64 / 180.0 * PI;
                positions.insert(node.id.clone(), (theta.cos() * 0.5, theta.sin() * 0.5));
            }
        }

        let count = self.write_positions(&ng, &positions).await?;
        Ok(LayoutOutcome {
            success: true,
            mode: "clustered".to_string(),
            nodes: count,
        })
    }

    /// Persist positions plus refreshed degree counts.
    async fn write_positions(
        &self,
        ng: &NamespaceGraph,
        positions: &HashMap<String, (f64, f64)>,
    ) -> GraphResult<usize> {
        let max_degree = ng
            .index_of
            .values()
            .map(|&idx| ng.graph.neighbors(idx).count())
            .max()
            .unwrap_or(0)
            .max(1);
        let mut updates: Vec<(String, Map<String, Value>)> = Vec::new();
        for node in &ng.nodes {
            let mut props = node.properties.clone();
            let (x, y) = positions.get(&node.id).copied().unwrap_or((0.0, 0.0));
            let mut layout = props
                .get("layout")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            layout.insert("x".to_string(), Value::from(round4(x)));
            layout.insert("y".to_string(), Value::from(round4(y)));
            props.insert("layout".to_string(), Value::Object(layout));
            let degree = ng
                .index_of
                .get(&node.id)
                .map(|&idx| ng.graph.neighbors(idx).count())
                .unwrap_or(0);
            props.insert("degree".to_string(), Value::from(degree as u64));
            props.insert(
                "degree_norm".to_string(),
                Value::from(round4(degree as f64 / max_degree as f64)),
            );
            updates.push((node.id.clone(), props));
        }
        self.store.write_node_properties(&updates).await?;
        Ok(updates.len())
    }

    pub async fn compute_centrality(&self, namespace: &str) -> GraphResult<CentralityOutcome> {
        let ng = self.load(namespace).await?;
        let n = ng.nodes.len();
        if n == 0 {
            return Ok(CentralityOutcome {
                success: false,
                nodes_updated: 0,
                have_pagerank: false,
                have_betweenness: false,
            });
        }

        let pagerank = if n <= PAGERANK_NODE_CAP {
            Some(pagerank(&ng.graph, 0.85, 100))
        } else {
            None
        };
        let betweenness = if n <= BETWEENNESS_EXACT_CAP {
            Some(betweenness(&ng.graph, None))
        } else if n <= BETWEENNESS_SAMPLED_CAP {
            let k = ((n as f64 * 0.02) as usize).max(10);
            Some(betweenness(&ng.graph, Some(k)))
        } else {
            warn!(namespace, nodes = n, "betweenness skipped on large graph");
            None
        };

        let pr_norm = pagerank.as_ref().map(|v| min_max_normalize(v));
        let btw_norm = betweenness.as_ref().map(|v| min_max_normalize(v));

        let mut updates: Vec<(String, Map<String, Value>)> = Vec::new();
        for node in &ng.nodes {
            let Some(&idx) = ng.index_of.get(&node.id) else {
                continue;
            };
            let mut props = node.properties.clone();
            if let (Some(pr), Some(prn)) = (&pagerank, &pr_norm) {
                props.insert("pagerank".to_string(), Value::from(round8(pr[idx.index()])));
                props.insert(
                    "pagerank_norm".to_string(),
                    Value::from(round6(prn[idx.index()])),
                );
            }
            if let (Some(btw), Some(btwn)) = (&betweenness, &btw_norm) {
                props.insert(
                    "betweenness".to_string(),
                    Value::from(round8(btw[idx.index()])),
                );
                props.insert(
                    "betweenness_norm".to_string(),
                    Value::from(round6(btwn[idx.index()])),
                );
            }
            let mut parts = Vec::new();
            for key in ["pagerank_norm", "betweenness_norm", "degree_norm"] {
                if let Some(v) = props.get(key).and_then(Value::as_f64) {
                    parts.push(v);
                }
            }
            if !parts.is_empty() {
                let importance = parts.iter().sum::<f64>() / parts.len() as f64;
                props.insert("importance".to_string(), Value::from(round6(importance)));
            }
            updates.push((node.id.clone(), props));
        }
        self.store.write_node_properties(&updates).await?;
        Ok(CentralityOutcome {
            success: true,
            nodes_updated: updates.len(),
            have_pagerank: pagerank.is_some(),
            have_betweenness: betweenness.is_some(),
        })
    }
}

/// Fruchterman-Reingold relaxation from the given starting positions. When
/// `restrict` is set, only those nodes move and only edges among them pull.
fn spring_relax(
    ng: &NamespaceGraph,
    positions: &mut HashMap<String, (f64, f64)>,
    k: f64,
    iterations: usize,
    restrict: Option<&std::collections::HashSet<&String>>,
) {
    let ids: Vec<String> = match restrict {
        Some(set) => ng
            .nodes
            .iter()
            .filter(|n| set.contains(&n.id))
            .map(|n| n.id.clone())
            .collect(),
        None => ng.nodes.iter().map(|n| n.id.clone()).collect(),
    };
    if ids.len() < 2 {
        return;
    }
    let mut temperature = 0.1f64;
    let cooling = temperature / iterations as f64;

    for _ in 0..iterations {
        let mut disp: HashMap<&str, (f64, f64)> = HashMap::new();
        // Repulsion between all pairs.
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let a = positions[&ids[i]];
                let b = positions[&ids[j]];
                let (dx, dy) = (a.0 - b.0, a.1 - b.1);
                let dist = (dx * dx + dy * dy).sqrt().max(1e-6);
                let force = k * k / dist;
                let (fx, fy) = (dx / dist * force, dy / dist * force);
                let da = disp.entry(ids[i].as_str()).or_insert((0.0, 0.0));
                da.0 += fx;
                da.1 += fy;
                let db = disp.entry(ids[j].as_str()).or_insert((0.0, 0.0));
                db.0 -= fx;
                db.1 -= fy;
            }
        }
        // Attraction along edges.
        for edge in ng.graph.edge_indices() {
            let Some((a_idx, b_idx)) = ng.graph.edge_endpoints(edge) else {
                continue;
            };
            let a_id = ng
                .nodes
                .get(a_idx.index())
                .map(|n| n.id.as_str())
                .unwrap_or_default();
            let b_id = ng
                .nodes
                .get(b_idx.index())
                .map(|n| n.id.as_str())
                .unwrap_or_default();
            if let Some(set) = restrict {
                if !set.iter().any(|s| s.as_str() == a_id) || !set.iter().any(|s| s.as_str() == b_id)
                {
                    continue;
                }
            }
            let (Some(&pa), Some(&pb)) = (positions.get(a_id), positions.get(b_id)) else {
                continue;
            };
            let (dx, dy) = (pa.0 - pb.0, pa.1 - pb.1);
            let dist = (dx * dx + dy * dy).sqrt().max(1e-6);
            let force = dist * dist / k;
            let (fx, fy) = (dx / dist * force, dy / dist * force);
            if let Some(da) = disp.get_mut(a_id) {
                da.0 -= fx;
                da.1 -= fy;
            }
            if let Some(db) = disp.get_mut(b_id) {
                db.0 += fx;
                db.1 += fy;
            }
        }
        // Bounded displacement with cooling.
        for id in &ids {
            let (dx, dy) = disp.get(id.as_str()).copied().unwrap_or((0.0, 0.0));
            let len = (dx * dx + dy * dy).sqrt().max(1e-6);
            let step = len.min(temperature);
            if let Some(p) = positions.get_mut(id) {
                p.0 += dx / len * step;
                p.1 += dy / len * step;
            }
        }
        temperature = (temperature - cooling).max(1e-4);
    }
}

/// Undirected PageRank with dangling-mass redistribution.
pub fn pagerank(graph: &UnGraph<(), f64>, alpha: f64, iterations: usize) -> Vec<f64> {
    let n = graph.node_count();
    if n == 0 {
        return Vec::new();
    }
    let mut rank = vec![1.0 / n as f64; n];
    let degrees: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors(idx).count())
        .collect();
    for _ in 0..iterations {
        let mut next = vec![(1.0 - alpha) / n as f64; n];
        let mut dangling = 0.0;
        for idx in graph.node_indices() {
            let i = idx.index();
            if degrees[i] == 0 {
                dangling += rank[i];
                continue;
            }
            let share = alpha * rank[i] / degrees[i] as f64;
            for nb in graph.neighbors(idx) {
                next[nb.index()] += share;
            }
        }
        let dangling_share = alpha * dangling / n as f64;
        for v in next.iter_mut() {
            *v += dangling_share;
        }
        rank = next;
    }
    rank
}

/// Brandes betweenness. `pivots = None` is exact; otherwise the first k
/// nodes in id-sorted order act as sources (deterministic sampling) and the
/// result is rescaled by n/k.
pub fn betweenness(graph: &UnGraph<(), f64>, pivots: Option<usize>) -> Vec<f64> {
    let n = graph.node_count();
    let mut centrality = vec![0.0f64; n];
    if n < 3 {
        return centrality;
    }
    let all: Vec<NodeIndex> = graph.node_indices().collect();
    let sources: Vec<NodeIndex> = match pivots {
        Some(k) => all.iter().copied().take(k.min(n)).collect(),
        None => all.clone(),
    };

    for &s in &sources {
        // Single-source shortest path counts.
        let mut stack = Vec::new();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist = vec![i64::MAX; n];
        sigma[s.index()] = 1.0;
        dist[s.index()] = 0;
        let mut queue = VecDeque::new();
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for w in graph.neighbors(v) {
                if dist[w.index()] == i64::MAX {
                    dist[w.index()] = dist[v.index()] + 1;
                    queue.push_back(w);
                }
                if dist[w.index()] == dist[v.index()] + 1 {
                    sigma[w.index()] += sigma[v.index()];
                    preds[w.index()].push(v.index());
                }
            }
        }
        // Dependency accumulation.
        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w.index()] {
                delta[v] += sigma[v] / sigma[w.index()] * (1.0 + delta[w.index()]);
            }
            if w != s {
                centrality[w.index()] += delta[w.index()];
            }
        }
    }

    // Undirected pair normalization, plus pivot rescale.
    let scale = 1.0 / ((n - 1) as f64 * (n - 2) as f64);
    let pivot_scale = match pivots {
        Some(k) if k < n => n as f64 / k as f64,
        _ => 1.0,
    };
    for v in centrality.iter_mut() {
        *v *= scale * pivot_scale;
    }
    centrality
}

pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < 1e-12 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

fn hash_of(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn round8(v: f64) -> f64 {
    (v * 100_000_000.0).round() / 100_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_graph(n: usize) -> UnGraph<(), f64> {
        let mut g = UnGraph::default();
        let idx: Vec<NodeIndex> = (0..n).map(|_| g.add_node(())).collect();
        for w in idx.windows(2) {
            g.add_edge(w[0], w[1], 1.0);
        }
        g
    }

    #[test]
    fn pagerank_sums_to_one_and_favors_center() {
        let g = path_graph(5);
        let pr = pagerank(&g, 0.85, 100);
        let total: f64 = pr.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        // Middle of a path outranks the endpoints.
        assert!(pr[2] > pr[0]);
        assert!(pr[2] > pr[4]);
    }

    #[test]
    fn betweenness_peaks_at_path_center() {
        let g = path_graph(5);
        let btw = betweenness(&g, None);
        let max_idx = btw
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(max_idx, 2);
        assert_eq!(btw[0], 0.0);
    }

    #[test]
    fn normalization_is_bounded_and_monotone() {
        let norm = min_max_normalize(&[1.0, 3.0, 2.0]);
        assert_eq!(norm[0], 0.0);
        assert_eq!(norm[1], 1.0);
        assert!(norm[2] > norm[0] && norm[2] < norm[1]);
        assert_eq!(min_max_normalize(&[2.0, 2.0]), vec![0.0, 0.0]);
    }
}
