//! Entity/relation extraction and label classification.
//!
//! Extraction prefers the LLM client; on failure or absence the heuristic
//! path mines capital-initial words, acronyms and a small domain keyword
//! list, chaining consecutive entities with low-confidence RELATED_TO edges.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::ai::LlmClient;
use crate::models::label;

const MAX_HEURISTIC_ENTITIES: usize = 80;
const MAX_FALLBACK_PHRASES: usize = 50;
const MAX_LLM_ENTITIES: usize = 200;
const MAX_LLM_RELATIONS: usize = 400;

lazy_static! {
    static ref CAPITAL_WORD: Regex = Regex::new(r"\b[A-Z][a-zA-Z]{2,}\b").unwrap();
    static ref ACRONYM: Regex = Regex::new(r"\b[A-Z]{2,}\b").unwrap();
    static ref DOMAIN_KEYWORD: Regex = Regex::new(
        r"(?i)\b(gradient|descent|optimization|algorithm|parameters|mini-batch|batch|stochastic|momentum)\b"
    )
    .unwrap();
    static ref PROPER_PHRASE: Regex =
        Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-zA-Z]+){0,3})\b").unwrap();
    static ref WORD: Regex = Regex::new(r"[A-Za-z0-9&]+").unwrap();
    static ref TECH_KEYWORDS: HashSet<&'static str> = [
        "python", "typescript", "javascript", "react", "vue", "angular", "rust", "docker",
        "kubernetes", "aws", "gcp", "azure", "postgres", "mysql", "sqlite", "redis", "kafka",
        "spark", "airflow", "pytorch", "tensorflow", "llm", "transformer", "langchain", "openai",
        "neo4j", "graph", "k8s", "helm", "terraform", "ansible", "sql", "graphql", "fastapi",
        "django", "flask", "pandas", "numpy", "scikit", "sklearn", "hadoop", "elastic",
        "elasticsearch",
    ]
    .into_iter()
    .collect();
    static ref ORG_KEYWORDS: HashSet<&'static str> = [
        "google", "microsoft", "amazon", "openai", "meta", "ibm", "oracle", "netflix", "apple",
        "nvidia", "intel", "salesforce",
    ]
    .into_iter()
    .collect();
}

const ORG_SUFFIXES: &[&str] = &[
    "inc",
    "corp",
    "corporation",
    "llc",
    "l.l.c",
    "ltd",
    "company",
    "university",
    "labs",
    "institute",
    "systems",
];

const ROLE_KEYWORDS: &[&str] = &[
    "engineer",
    "developer",
    "scientist",
    "manager",
    "lead",
    "architect",
    "director",
    "specialist",
    "analyst",
    "researcher",
    "consultant",
    "founder",
    "cto",
    "ceo",
    "head",
    "principal",
];

const ACHIEVEMENT_KEYWORDS: &[&str] = &[
    "award",
    "patent",
    "publication",
    "certified",
    "certification",
    "speaker",
    "presented",
    "keynote",
];

#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub id: String,
    pub label: String,
    pub name: String,
    pub properties: Map<String, Value>,
}

impl ExtractedEntity {
    fn new(name: &str, source: &str) -> Self {
        let mut properties = Map::new();
        properties.insert("source".to_string(), Value::String(source.to_string()));
        Self {
            id: Uuid::new_v4().to_string(),
            label: label::ENTITY.to_string(),
            name: name.to_string(),
            properties,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedRelation {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub confidence: f64,
}

#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub nodes: Vec<ExtractedEntity>,
    pub edges: Vec<ExtractedRelation>,
    pub reasoning: String,
}

pub struct Extractor {
    llm: Option<Arc<LlmClient>>,
}

impl Extractor {
    pub fn new(llm: Option<Arc<LlmClient>>) -> Self {
        Self { llm }
    }

    /// Full extraction pipeline: LLM (unless forced heuristic), heuristic
    /// fallback, classification enrichment, and proper-noun phrase mining
    /// when the result is otherwise empty.
    pub async fn extract(&self, text: &str, force_heuristic: bool) -> ExtractionResult {
        let mut result = if force_heuristic {
            heuristic_extract(text)
        } else {
            match &self.llm {
                Some(llm) => match llm.extract_entities_relations(text).await {
                    Ok(raw) => llm_to_result(raw),
                    Err(e) => {
                        warn!("llm extraction failed, falling back to heuristic: {}", e);
                        heuristic_extract(text)
                    }
                },
                None => heuristic_extract(text),
            }
        };

        classify_enrich(&mut result);

        if result.nodes.is_empty() {
            let phrases = mine_proper_phrases(text);
            if !phrases.is_empty() {
                result.reasoning = format!("{} + fallback phrases", result.reasoning);
                result.nodes = phrases;
            }
        }
        result
    }
}

fn llm_to_result(raw: crate::ai::LlmExtraction) -> ExtractionResult {
    let mut nodes = Vec::new();
    for entity in raw.entities.into_iter().take(MAX_LLM_ENTITIES) {
        if entity.name.trim().is_empty() {
            continue;
        }
        let mut node = ExtractedEntity::new(entity.name.trim(), "llm");
        if let Some(t) = entity.r#type {
            if !t.is_empty() {
                node.label = t;
            }
        }
        if let Some(desc) = entity.description {
            node.properties
                .insert("description".to_string(), Value::String(desc));
        }
        nodes.push(node);
    }
    let mut edges = Vec::new();
    for rel in raw.relations.into_iter().take(MAX_LLM_RELATIONS) {
        let source = nodes.iter().find(|n| n.name == rel.source);
        let target = nodes.iter().find(|n| n.name == rel.target);
        if let (Some(s), Some(t)) = (source, target) {
            edges.push(ExtractedRelation {
                source_id: s.id.clone(),
                target_id: t.id.clone(),
                relation: rel.r#type.unwrap_or_else(|| "RELATED_TO".to_string()),
                confidence: rel.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
            });
        }
    }
    ExtractionResult {
        nodes,
        edges,
        reasoning: "LLM extraction".to_string(),
    }
}

pub fn heuristic_extract(text: &str) -> ExtractionResult {
    let mut ordered: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |w: &str| {
        if !w.is_empty() && seen.insert(w.to_string()) {
            ordered.push(w.to_string());
        }
    };
    for m in CAPITAL_WORD.find_iter(text) {
        push(m.as_str());
    }
    for m in ACRONYM.find_iter(text) {
        push(m.as_str());
    }
    for m in DOMAIN_KEYWORD.find_iter(text) {
        push(&m.as_str().to_lowercase());
    }
    ordered.truncate(MAX_HEURISTIC_ENTITIES);

    let nodes: Vec<ExtractedEntity> = ordered
        .iter()
        .map(|w| ExtractedEntity::new(w, "heuristic"))
        .collect();
    let mut edges = Vec::new();
    for pair in nodes.windows(2) {
        edges.push(ExtractedRelation {
            source_id: pair[0].id.clone(),
            target_id: pair[1].id.clone(),
            relation: "RELATED_TO".to_string(),
            confidence: 0.35,
        });
    }
    ExtractionResult {
        nodes,
        edges,
        reasoning: "Heuristic extraction".to_string(),
    }
}

fn mine_proper_phrases(text: &str) -> Vec<ExtractedEntity> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut nodes = Vec::new();
    for cap in PROPER_PHRASE.captures_iter(text) {
        let phrase = cap[1].trim().to_string();
        if phrase.len() < 3 {
            continue;
        }
        if !seen.insert(phrase.to_lowercase()) {
            continue;
        }
        nodes.push(ExtractedEntity::new(&phrase, "fallback-phrase"));
        if nodes.len() >= MAX_FALLBACK_PHRASES {
            break;
        }
    }
    nodes
}

/// Refine `Entity` labels in place using closed keyword sets.
pub fn classify_enrich(result: &mut ExtractionResult) {
    for node in &mut result.nodes {
        node.label = classify_name(&node.name, &node.label);
    }
}

pub fn classify_name(name: &str, current_label: &str) -> String {
    let base = name.to_lowercase();
    let base = base.trim();
    let mut lbl = current_label.to_string();

    if TECH_KEYWORDS.iter().any(|k| base.contains(k)) {
        return label::TECHNOLOGY.to_string();
    }
    if lbl == label::ENTITY {
        let words: Vec<&str> = WORD.find_iter(name).map(|m| m.as_str()).collect();
        let two_title_words = words.len() >= 2
            && words[..2]
                .iter()
                .all(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false));
        if two_title_words
            || ORG_SUFFIXES.iter().any(|s| base.ends_with(s))
            || ORG_KEYWORDS.contains(base)
        {
            lbl = label::ORGANIZATION.to_string();
        }
    }
    if lbl == label::ENTITY && ROLE_KEYWORDS.iter().any(|k| base.contains(k)) {
        lbl = label::ROLE.to_string();
    }
    if lbl == label::ENTITY && ACHIEVEMENT_KEYWORDS.iter().any(|k| base.contains(k)) {
        lbl = label::ACHIEVEMENT.to_string();
    }
    lbl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_finds_capitals_acronyms_and_keywords() {
        let result =
            heuristic_extract("Gradient Descent optimizes parameters. SGD uses mini-batch steps.");
        let names: Vec<&str> = result.nodes.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"Gradient"));
        assert!(names.contains(&"SGD"));
        assert!(names.contains(&"parameters"));
        assert_eq!(result.edges.len(), result.nodes.len() - 1);
        assert!(result.edges.iter().all(|e| e.confidence == 0.35));
    }

    #[test]
    fn heuristic_dedupes_in_encounter_order_and_caps() {
        let text = "Alpha Alpha Beta Alpha Beta Gamma";
        let result = heuristic_extract(text);
        let names: Vec<&str> = result.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);

        let many: String = (0..200).map(|i| format!("Word{} ", i)).collect();
        assert_eq!(heuristic_extract(&many).nodes.len(), 80);
    }

    #[test]
    fn classification_covers_all_refinements() {
        assert_eq!(classify_name("Docker", "Entity"), "Technology");
        assert_eq!(classify_name("Acme Labs", "Entity"), "Organization");
        assert_eq!(classify_name("Senior Data Engineer", "Entity"), "Organization");
        assert_eq!(classify_name("engineer", "Entity"), "Role");
        assert_eq!(classify_name("patent holder", "Entity"), "Achievement");
        assert_eq!(classify_name("banana", "Entity"), "Entity");
        // A specific label from extraction is kept unless tech matches.
        assert_eq!(classify_name("Somebody", "Person"), "Person");
    }

    #[test]
    fn phrase_mining_caps_and_dedupes() {
        let text = "Alice Wonder met Alice Wonder and Bob Stone near Carol Finch.";
        let phrases = mine_proper_phrases(text);
        let names: Vec<&str> = phrases.iter().map(|n| n.name.as_str()).collect();
        assert!(names.len() >= 2);
        let lowered: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
        assert_eq!(lowered.len(), names.len());
    }

    #[tokio::test]
    async fn extractor_without_llm_uses_heuristic() {
        let extractor = Extractor::new(None);
        let result = extractor.extract("Kafka streams feed Spark jobs.", false).await;
        assert_eq!(result.reasoning, "Heuristic extraction");
        assert!(result
            .nodes
            .iter()
            .any(|n| n.label == label::TECHNOLOGY));
    }
}
