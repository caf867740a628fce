//! Local fallback artifact pipeline.
//!
//! Aggregates per-file extractions from the raw docs directory into the
//! four artifact CSVs (entities, relationships, communities,
//! community_reports). When stale doc ids are known, only their files are
//! processed; with no matching files the whole directory is used, and with
//! no files at all a minimal placeholder set keeps the import path alive.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::GraphResult;
use crate::models::label;
use crate::services::extraction::Extractor;

const MAX_DOC_CHARS: usize = 120_000;
const REPORT_NAME_CAP: usize = 12;

pub async fn run_fallback_pipeline(
    extractor: &Extractor,
    raw_docs_dir: &Path,
    staging: &Path,
    stale_doc_ids: &[String],
) -> GraphResult<()> {
    let all_files = text_files(raw_docs_dir);
    let targets: Vec<PathBuf> = if stale_doc_ids.is_empty() {
        all_files.clone()
    } else {
        let selected: Vec<PathBuf> = all_files
            .iter()
            .filter(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .map(|stem| stale_doc_ids.iter().any(|d| d == stem))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if selected.is_empty() {
            all_files.clone()
        } else {
            selected
        }
    };

    if targets.is_empty() {
        debug!("no raw documents found, writing placeholder artifacts");
        return write_placeholder(staging);
    }

    // Aggregate extractions across files; entities are canonical by name.
    let mut entities: Vec<(String, String, String, String)> = Vec::new(); // id, name, type, description
    let mut id_by_name: HashMap<String, String> = HashMap::new();
    let mut rel_weights: HashMap<(String, String, String), f64> = HashMap::new();

    for file in &targets {
        let text = match fs::read_to_string(file) {
            Ok(t) => t.chars().take(MAX_DOC_CHARS).collect::<String>(),
            Err(e) => {
                warn!("skipping unreadable doc {:?}: {}", file, e);
                continue;
            }
        };
        if text.trim().is_empty() {
            continue;
        }
        let result = extractor.extract(&text, false).await;

        let mut extraction_id_to_key: HashMap<String, String> = HashMap::new();
        let mut file_labels: HashMap<String, String> = HashMap::new();
        for node in &result.nodes {
            let key = node.name.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let entity_id = id_by_name.entry(key.clone()).or_insert_with(|| {
                let id = key.replace(' ', "_");
                let description = node
                    .properties
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                entities.push((id.clone(), node.name.trim().to_string(), node.label.clone(), description));
                id
            });
            file_labels.insert(entity_id.clone(), node.label.clone());
            extraction_id_to_key.insert(node.id.clone(), key);
        }
        for edge in &result.edges {
            let (Some(src_key), Some(dst_key)) = (
                extraction_id_to_key.get(&edge.source_id),
                extraction_id_to_key.get(&edge.target_id),
            ) else {
                continue;
            };
            let (Some(src), Some(dst)) = (id_by_name.get(src_key), id_by_name.get(dst_key)) else {
                continue;
            };
            *rel_weights
                .entry((src.clone(), dst.clone(), edge.relation.clone()))
                .or_insert(0.0) += 1.0;
        }

        // Domain relations from labels seen in the same file.
        let roles: Vec<&String> = file_labels
            .iter()
            .filter(|(_, l)| l.as_str() == label::ROLE)
            .map(|(id, _)| id)
            .collect();
        let orgs: Vec<&String> = file_labels
            .iter()
            .filter(|(_, l)| l.as_str() == label::ORGANIZATION)
            .map(|(id, _)| id)
            .collect();
        let techs: Vec<&String> = file_labels
            .iter()
            .filter(|(_, l)| l.as_str() == label::TECHNOLOGY)
            .map(|(id, _)| id)
            .collect();
        for role in &roles {
            for org in &orgs {
                *rel_weights
                    .entry(((*role).clone(), (*org).clone(), "ROLE_AT".to_string()))
                    .or_insert(0.0) += 0.5;
            }
        }
        for holder in roles.iter().chain(orgs.iter()) {
            for tech in &techs {
                *rel_weights
                    .entry(((*holder).clone(), (*tech).clone(), "USES_TECH".to_string()))
                    .or_insert(0.0) += 0.4;
            }
        }
    }

    if entities.is_empty() {
        return write_placeholder(staging);
    }

    write_entities(staging, &entities)?;
    let mut rels: Vec<(&(String, String, String), &f64)> = rel_weights.iter().collect();
    rels.sort_by(|a, b| a.0.cmp(b.0));
    write_relationships(staging, &rels)?;

    // Communities via connected components over the relationship graph.
    let ids: Vec<&String> = entities.iter().map(|(id, _, _, _)| id).collect();
    let communities = connected_components(&ids, &rel_weights);
    write_communities(staging, &communities)?;
    write_reports(staging, &communities, &entities)?;
    Ok(())
}

fn text_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_text_files(dir, &mut files);
    files.sort();
    files
}

fn collect_text_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_text_files(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md")
        ) {
            out.push(path);
        }
    }
}

fn connected_components(
    ids: &[&String],
    rel_weights: &HashMap<(String, String, String), f64>,
) -> Vec<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (src, dst, _) in rel_weights.keys() {
        adjacency.entry(src.as_str()).or_default().push(dst.as_str());
        adjacency.entry(dst.as_str()).or_default().push(src.as_str());
    }
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut components = Vec::new();
    for &id in ids {
        if seen.contains(id.as_str()) {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![id.as_str()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            component.push(current.to_string());
            if let Some(neighbors) = adjacency.get(current) {
                for &n in neighbors {
                    if !seen.contains(n) {
                        stack.push(n);
                    }
                }
            }
        }
        component.sort();
        components.push(component);
    }
    components
}

fn write_placeholder(staging: &Path) -> GraphResult<()> {
    fs::create_dir_all(staging)?;
    fs::write(
        staging.join("entities.csv"),
        "entity_id,name,type,description\neA,Alpha,Concept,Alpha desc\n",
    )?;
    fs::write(
        staging.join("relationships.csv"),
        "relationship_id,src_id,dst_id,relationship_type,weight\nr1,eA,eA,RELATED_TO,1.0\n",
    )?;
    fs::write(staging.join("communities.csv"), "community_id,entity_id\nc1,eA\n")?;
    fs::write(
        staging.join("community_reports.csv"),
        "community_id,report_title,report_summary\nc1,Community C1,Synthetic summary\n",
    )?;
    Ok(())
}

fn write_entities(staging: &Path, entities: &[(String, String, String, String)]) -> GraphResult<()> {
    let mut out = String::from("entity_id,name,type,description\n");
    for (id, name, label, description) in entities {
        out.push_str(&format!(
            "{},{},{},{}\n",
            csv_field(id),
            csv_field(name),
            csv_field(label),
            csv_field(description)
        ));
    }
    fs::write(staging.join("entities.csv"), out)?;
    Ok(())
}

fn write_relationships(
    staging: &Path,
    rels: &[(&(String, String, String), &f64)],
) -> GraphResult<()> {
    let mut out = String::from("relationship_id,src_id,dst_id,relationship_type,weight\n");
    for (i, ((src, dst, rel), weight)) in rels.iter().enumerate() {
        out.push_str(&format!(
            "r{},{},{},{},{}\n",
            i + 1,
            csv_field(src),
            csv_field(dst),
            csv_field(rel),
            weight
        ));
    }
    fs::write(staging.join("relationships.csv"), out)?;
    Ok(())
}

fn write_communities(staging: &Path, communities: &[Vec<String>]) -> GraphResult<()> {
    let mut out = String::from("community_id,entity_id\n");
    for (i, community) in communities.iter().enumerate() {
        for entity_id in community {
            out.push_str(&format!("c{},{}\n", i + 1, csv_field(entity_id)));
        }
    }
    fs::write(staging.join("communities.csv"), out)?;
    Ok(())
}

fn write_reports(
    staging: &Path,
    communities: &[Vec<String>],
    entities: &[(String, String, String, String)],
) -> GraphResult<()> {
    let name_of: HashMap<&str, &str> = entities
        .iter()
        .map(|(id, name, _, _)| (id.as_str(), name.as_str()))
        .collect();
    let mut out = String::from("community_id,report_title,report_summary\n");
    for (i, community) in communities.iter().enumerate() {
        let names: Vec<&str> = community
            .iter()
            .filter_map(|id| name_of.get(id.as_str()).copied())
            .take(REPORT_NAME_CAP)
            .collect();
        out.push_str(&format!(
            "c{},Community {},{}\n",
            i + 1,
            i + 1,
            csv_field(&format!("Entities: {}", names.join("; ")))
        ));
    }
    fs::write(staging.join("community_reports.csv"), out)?;
    Ok(())
}

/// The artifact dialect is comma-free per field: commas and newlines are
/// replaced so plain `split(',')` parsing on the read side stays correct.
fn csv_field(value: &str) -> String {
    value.replace([',', '\n', '\r'], " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_fields_are_comma_free() {
        assert_eq!(csv_field("a,b\nc"), "a b c");
    }

    #[test]
    fn connected_components_split_disjoint_graphs() {
        let a = "a".to_string();
        let b = "b".to_string();
        let c = "c".to_string();
        let ids = vec![&a, &b, &c];
        let mut rels = HashMap::new();
        rels.insert(("a".to_string(), "b".to_string(), "RELATED_TO".to_string()), 1.0);
        let comps = connected_components(&ids, &rels);
        assert_eq!(comps.len(), 2);
        assert!(comps.iter().any(|c| c.len() == 2));
        assert!(comps.iter().any(|c| c == &vec!["c".to_string()]));
    }
}
