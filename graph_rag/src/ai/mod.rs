//! LLM and embedding capability clients.
//!
//! Both capabilities are optional: when no API key is configured the service
//! falls back to heuristic extraction and skips embeddings entirely. Every
//! upstream call carries a timeout and a bounded retry budget.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateEmbeddingRequest, EmbeddingInput,
    },
    Client as OpenAIClient,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::errors::{GraphError, GraphResult};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: usize = 2;

/// Entity/relation shape produced by LLM extraction.
#[derive(Debug, Default, Deserialize)]
pub struct LlmExtraction {
    #[serde(default, alias = "nodes")]
    pub entities: Vec<LlmEntity>,
    #[serde(default, alias = "edges")]
    pub relations: Vec<LlmRelation>,
}

#[derive(Debug, Deserialize)]
pub struct LlmEntity {
    pub name: String,
    #[serde(default, alias = "label")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LlmRelation {
    pub source: String,
    pub target: String,
    #[serde(default, alias = "relation")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ClusterSummaryPayload {
    #[serde(default, alias = "title")]
    label: Option<String>,
    #[serde(default, alias = "text")]
    summary: Option<String>,
}

pub struct LlmClient {
    client: OpenAIClient<OpenAIConfig>,
    chat_model: String,
    embedding_model: String,
}

impl LlmClient {
    /// Build a client when credentials are configured, None otherwise.
    pub fn from_config(cfg: &graphrag_config::AppConfig) -> Option<Arc<Self>> {
        if cfg.openai_api_key.is_empty() {
            return None;
        }
        let config = OpenAIConfig::new().with_api_key(cfg.openai_api_key.clone());
        Some(Arc::new(Self {
            client: OpenAIClient::with_config(config),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: cfg.embedding_model.clone(),
        }))
    }

    pub async fn embed_text(&self, text: &str) -> GraphResult<Vec<f32>> {
        let mut last_err = String::new();
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1u64 << (attempt - 1))).await;
            }
            let embeddings = self.client.embeddings();
            let call = embeddings.create(CreateEmbeddingRequest {
                model: self.embedding_model.clone(),
                input: EmbeddingInput::String(text.to_string()),
                ..Default::default()
            });
            match tokio::time::timeout(CALL_TIMEOUT, call).await {
                Ok(Ok(response)) => {
                    return response
                        .data
                        .into_iter()
                        .next()
                        .map(|d| d.embedding)
                        .ok_or_else(|| GraphError::Upstream("no embedding returned".to_string()));
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "embedding call timed out".to_string(),
            }
        }
        Err(GraphError::Upstream(last_err))
    }

    async fn chat_complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u16,
    ) -> GraphResult<String> {
        let mut last_err = String::new();
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1u64 << (attempt - 1))).await;
            }
            let request = CreateChatCompletionRequestArgs::default()
                .model(self.chat_model.clone())
                .max_tokens(max_tokens)
                .messages([
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(system)
                        .build()
                        .map_err(|e| GraphError::Upstream(e.to_string()))?
                        .into(),
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(user)
                        .build()
                        .map_err(|e| GraphError::Upstream(e.to_string()))?
                        .into(),
                ])
                .build()
                .map_err(|e| GraphError::Upstream(e.to_string()))?;
            match tokio::time::timeout(CALL_TIMEOUT, self.client.chat().create(request)).await {
                Ok(Ok(response)) => {
                    let content = response
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .unwrap_or_default();
                    return Ok(content);
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "chat call timed out".to_string(),
            }
        }
        Err(GraphError::Upstream(last_err))
    }

    /// Entity/relation extraction via JSON-mode prompting.
    pub async fn extract_entities_relations(&self, text: &str) -> GraphResult<LlmExtraction> {
        let system = "You extract knowledge graphs. Return ONLY JSON of the form \
            {\"entities\":[{\"name\":str,\"type\":str,\"description\":str}],\
            \"relations\":[{\"source\":str,\"target\":str,\"type\":str,\"confidence\":float}]}. \
            Types: Entity, Technology, Organization, Role, Achievement.";
        let user = truncate_chars(text, 24_000);
        let raw = self.chat_complete(system, &user, 2048).await?;
        let json = strip_code_fences(&raw);
        serde_json::from_str::<LlmExtraction>(json)
            .map_err(|e| GraphError::Upstream(format!("extraction parse failed: {}", e)))
    }

    pub async fn generate_answer(&self, question: &str, context: &str) -> GraphResult<String> {
        let system = "Answer the question strictly from the provided context. \
            If the context is insufficient, say so briefly.";
        let user = format!("CONTEXT:\n{}\n\nQUESTION: {}", truncate_chars(context, 24_000), question);
        let answer = self.chat_complete(system, &user, 768).await?;
        Ok(answer.trim().to_string())
    }

    /// Cluster labelling: returns `(label, summary)`.
    pub async fn summarize_cluster(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> GraphResult<(String, String)> {
        let system = "You label graph clusters. Return ONLY JSON with keys \
            label (under 12 words) and summary (2 concise sentences).";
        let raw = self
            .chat_complete(system, prompt, max_tokens.min(u16::MAX as u32) as u16)
            .await?;
        let payload: ClusterSummaryPayload = serde_json::from_str(strip_code_fences(&raw))
            .map_err(|e| GraphError::Upstream(format!("summary parse failed: {}", e)))?;
        Ok((
            payload.label.unwrap_or_else(|| "Cluster".to_string()),
            payload.summary.unwrap_or_default(),
        ))
    }
}

/// Process-wide embedding cache keyed by exact text. Empty vectors are
/// cached too so a failing upstream is not retried for the same input.
pub struct EmbeddingService {
    llm: Option<Arc<LlmClient>>,
    enabled: bool,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(llm: Option<Arc<LlmClient>>, enabled: bool) -> Self {
        Self {
            llm,
            enabled,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.enabled && self.llm.is_some()
    }

    /// Embed one text; returns an empty vector when embeddings are off or the
    /// upstream keeps failing.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        if let Some(hit) = self.cache.lock().get(text) {
            return hit.clone();
        }
        let vec = match (&self.llm, self.enabled) {
            (Some(llm), true) => match llm.embed_text(text).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(len = text.len(), "embedding failed: {}", e);
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };
        self.cache.lock().insert(text.to_string(), vec.clone());
        vec
    }

    pub async fn embed_many(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await);
        }
        out
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn embedding_service_without_client_returns_empty_and_caches() {
        let svc = EmbeddingService::new(None, false);
        assert!(!svc.is_configured());
        assert!(svc.embed("hello").await.is_empty());
        assert!(svc.cache.lock().contains_key("hello"));
    }

    #[test]
    fn extraction_payload_accepts_aliases() {
        let json = r#"{"nodes":[{"name":"Rust","label":"Technology"}],
                       "edges":[{"source":"Rust","target":"Cargo","relation":"RELATED_TO"}]}"#;
        let parsed: LlmExtraction = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.relations.len(), 1);
    }
}
