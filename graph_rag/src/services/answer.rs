//! Retrieval-augmented answering: context assembly from retrieved chunks
//! plus LLM synthesis when a client is configured.

use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::ai::LlmClient;
use crate::errors::GraphResult;
use crate::metrics::{keys, MetricsRegistry};
use crate::models::label;
use crate::services::retrieval::{RetrievedGraph, Retriever};

const CONTEXT_CHUNK_CAP: usize = 5;

pub struct AnswerOutcome {
    pub answer: String,
    pub retrieved: RetrievedGraph,
}

pub struct Answerer {
    retriever: Arc<Retriever>,
    llm: Option<Arc<LlmClient>>,
    metrics: Arc<MetricsRegistry>,
}

impl Answerer {
    pub fn new(
        retriever: Arc<Retriever>,
        llm: Option<Arc<LlmClient>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            retriever,
            llm,
            metrics,
        }
    }

    pub async fn answer(
        &self,
        question: &str,
        top_k: usize,
        namespace: &str,
    ) -> GraphResult<AnswerOutcome> {
        self.metrics.incr(keys::ANSWER_REQUESTS, 1);
        let started = Instant::now();

        let retrieved = self
            .retriever
            .hybrid_retrieve(question, top_k, namespace, None, None)
            .await?;

        let chunks: Vec<&str> = retrieved
            .nodes
            .iter()
            .filter(|n| n.label == label::CHUNK)
            .filter_map(|n| n.prop_str("text"))
            .take(CONTEXT_CHUNK_CAP)
            .collect();
        let context = chunks.join("\n---\n");

        let mut answer = String::new();
        if !context.is_empty() {
            if let Some(llm) = &self.llm {
                match llm.generate_answer(question, &context).await {
                    Ok(text) => answer = text,
                    Err(e) => warn!("answer synthesis failed: {}", e),
                }
            }
        }

        self.metrics
            .observe_latency(keys::ANSWER_LATENCY, started.elapsed().as_secs_f64());
        Ok(AnswerOutcome { answer, retrieved })
    }
}
