//! Idempotent artifact import into the graph store.
//!
//! Entities merge on id or `(lower(name), namespace)` preserving existing
//! embeddings; relationships merge on `(source, target, relation,
//! namespace)` upgrading confidence to the max; community memberships are
//! deduped under algorithm `graphrag`; community reports are insert-if-
//! absent with empty summaries refreshed.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::{GraphError, GraphResult};
use crate::models::{ClusterMembership, GraphEdge, GraphNode};
use crate::store::SqlStore;

const LABEL_CAP: usize = 64;
const NAME_CAP: usize = 256;

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub missing: Vec<String>,
    pub entities_new: usize,
    pub entities_merged: usize,
    pub relationships_new: usize,
    pub relationships_merged: usize,
    pub memberships_added: usize,
    pub reports_added: usize,
}

pub async fn import_artifacts(
    store: &SqlStore,
    staging: &Path,
    namespace: &str,
) -> GraphResult<ImportSummary> {
    if !staging.exists() {
        return Err(GraphError::NotFound(format!(
            "artifact path {}",
            staging.display()
        )));
    }
    let mut summary = ImportSummary::default();

    match find_file(staging, "entities") {
        Some(path) => import_entities(store, &path, namespace, &mut summary).await?,
        None => {
            warn!("entities file not found in {}", staging.display());
            summary.missing.push("entities".to_string());
        }
    }
    match find_file(staging, "relationships") {
        Some(path) => import_relationships(store, &path, namespace, &mut summary).await?,
        None => {
            warn!("relationships file not found in {}", staging.display());
            summary.missing.push("relationships".to_string());
        }
    }
    match find_file(staging, "communities") {
        Some(path) => import_communities(store, &path, namespace, &mut summary).await?,
        None => {
            warn!("communities file not found in {}", staging.display());
            summary.missing.push("communities".to_string());
        }
    }
    match find_file(staging, "community_reports") {
        Some(path) => import_reports(store, &path, namespace, &mut summary).await?,
        None => {
            warn!("community reports file not found in {}", staging.display());
            summary.missing.push("community_reports".to_string());
        }
    }

    info!(
        namespace,
        entities_new = summary.entities_new,
        entities_merged = summary.entities_merged,
        relationships_new = summary.relationships_new,
        relationships_merged = summary.relationships_merged,
        "artifact import complete"
    );
    Ok(summary)
}

/// `communities.csv` must not match a `community_reports.csv` lookup and
/// vice versa, so match on the file stem prefix.
fn find_file(dir: &Path, key: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_stem()
                    .and_then(|n| n.to_str())
                    .map(|stem| stem == key || stem.ends_with(&format!("_{}", key)))
                    .unwrap_or(false)
                && p.extension().and_then(|e| e.to_str()) == Some("csv")
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

fn read_rows(path: &Path) -> GraphResult<Vec<Vec<String>>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split(',').map(|c| c.trim().to_string()).collect())
        .collect())
}

async fn import_entities(
    store: &SqlStore,
    path: &Path,
    namespace: &str,
    summary: &mut ImportSummary,
) -> GraphResult<()> {
    for row in read_rows(path)? {
        // entity_id,name,type,description
        let Some(id) = row.first().filter(|v| !v.is_empty()) else {
            continue;
        };
        let name = row.get(1).cloned().unwrap_or_else(|| id.clone());
        let label = row
            .get(2)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| "Entity".to_string());
        let description = row.get(3).cloned().unwrap_or_default();

        let mut node = GraphNode::new(
            id.clone(),
            &truncate(&label, LABEL_CAP),
            truncate(&name, NAME_CAP),
            namespace,
        );
        if !description.is_empty() {
            node.properties
                .insert("summary".to_string(), Value::from(description));
        }
        node.properties
            .insert("gr_source".to_string(), Value::from("graphrag_artifact"));
        if store.merge_artifact_entity(&node).await? {
            summary.entities_new += 1;
        } else {
            summary.entities_merged += 1;
        }
    }
    Ok(())
}

async fn import_relationships(
    store: &SqlStore,
    path: &Path,
    namespace: &str,
    summary: &mut ImportSummary,
) -> GraphResult<()> {
    for row in read_rows(path)? {
        // relationship_id,src_id,dst_id,relationship_type,weight
        if row.len() < 3 {
            continue;
        }
        let (source, target) = (&row[1], &row[2]);
        if source.is_empty() || target.is_empty() {
            continue;
        }
        let relation = row
            .get(3)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_uppercase())
            .unwrap_or_else(|| "RELATED_TO".to_string());
        let weight: f64 = row.get(4).and_then(|v| v.parse().ok()).unwrap_or(0.6);

        let mut edge = GraphEdge::new(
            source.clone(),
            target.clone(),
            &relation,
            weight.clamp(0.0, 1.0),
            namespace,
        );
        if !row[0].is_empty() {
            edge.id = row[0].clone();
        }
        edge.properties
            .insert("weight".to_string(), Value::from(weight));
        edge.properties
            .insert("gr_source".to_string(), Value::from("graphrag_artifact"));
        if store.merge_artifact_edge(&edge).await? {
            summary.relationships_new += 1;
        } else {
            summary.relationships_merged += 1;
        }
    }
    Ok(())
}

async fn import_communities(
    store: &SqlStore,
    path: &Path,
    namespace: &str,
    summary: &mut ImportSummary,
) -> GraphResult<()> {
    for row in read_rows(path)? {
        // community_id,entity_id
        if row.len() < 2 || row[0].is_empty() || row[1].is_empty() {
            continue;
        }
        let membership = ClusterMembership {
            node_id: row[1].clone(),
            cluster_id: row[0].clone(),
            namespace: namespace.to_string(),
            algorithm: "graphrag".to_string(),
            score: None,
        };
        if store.add_membership_if_absent(&membership).await? {
            summary.memberships_added += 1;
        }
    }
    Ok(())
}

async fn import_reports(
    store: &SqlStore,
    path: &Path,
    namespace: &str,
    summary: &mut ImportSummary,
) -> GraphResult<()> {
    for row in read_rows(path)? {
        // community_id,report_title,report_summary
        let Some(cluster_id) = row.first().filter(|v| !v.is_empty()) else {
            continue;
        };
        let title = row
            .get(1)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("Community {}", cluster_id));
        let body = row.get(2).cloned().unwrap_or_default();
        if store.upsert_report(namespace, cluster_id, &title, &body).await? {
            summary.reports_added += 1;
        }
    }
    Ok(())
}

fn truncate(value: &str, cap: usize) -> String {
    value.chars().take(cap).collect()
}
