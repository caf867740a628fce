use actix_web::{web, HttpRequest, HttpResponse};

use super::{check_api_key, ensure_enabled};
use crate::errors::{GraphError, GraphResult};
use crate::models::requests::{
    AnswerRequest, AnswerResponse, EdgeView, NodeView, PathRequest, PathResponse, QueryModeRequest,
    RetrievalMeta, RetrieveRequest, RetrieveResponse, SimilarNode, SimilarQuery,
};
use crate::models::NodeFilter;
use crate::services::pathfind::DEFAULT_MAX_DEPTH;
use crate::services::query_adapter::QueryMode;
use crate::services::retrieval::cosine;
use crate::state::AppState;

const DEFAULT_TOP_K: usize = 5;
const DEFAULT_QUERY2_TOP_K: usize = 8;
const DEFAULT_ANSWER_TOP_K: usize = 6;

pub async fn query(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    payload: web::Json<RetrieveRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let body = payload.into_inner();
    if body.query.trim().is_empty() {
        return Err(GraphError::InvalidInput("query is empty".to_string()));
    }
    let namespace = state.namespace_or_default(body.namespace.as_deref());
    let retrieved = state
        .retriever
        .hybrid_retrieve(
            &body.query,
            body.top_k.unwrap_or(DEFAULT_TOP_K),
            &namespace,
            body.label_filter.as_deref(),
            body.relation_filter.as_deref(),
        )
        .await?;
    Ok(HttpResponse::Ok().json(RetrieveResponse {
        nodes: retrieved.nodes.iter().map(NodeView::from).collect(),
        edges: retrieved.edges.iter().map(EdgeView::from).collect(),
        meta: RetrievalMeta {
            strategy: "hybrid".to_string(),
            chain: retrieved.chain,
        },
    }))
}

pub async fn query2(
    state: web::Data<std::sync::Arc<AppState>>,
    payload: web::Json<QueryModeRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let body = payload.into_inner();
    if body.query.trim().is_empty() {
        return Err(GraphError::InvalidInput("query is empty".to_string()));
    }
    let mode_raw = body.mode.unwrap_or_else(|| "auto".to_string());
    let mode = QueryMode::parse(&mode_raw)
        .ok_or_else(|| GraphError::InvalidInput(format!("unknown mode '{}'", mode_raw)))?;
    let namespace = state.namespace_or_default(body.namespace.as_deref());
    let outcome = state
        .query_adapter
        .query(
            &body.query,
            mode,
            body.top_k.unwrap_or(DEFAULT_QUERY2_TOP_K),
            &namespace,
        )
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn answer(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    payload: web::Json<AnswerRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let body = payload.into_inner();
    if body.question.trim().is_empty() {
        return Err(GraphError::InvalidInput("question is empty".to_string()));
    }
    let namespace = state.namespace_or_default(body.namespace.as_deref());
    let outcome = state
        .answerer
        .answer(
            &body.question,
            body.top_k.unwrap_or(DEFAULT_ANSWER_TOP_K),
            &namespace,
        )
        .await?;
    let contributing_ids = outcome
        .retrieved
        .nodes
        .iter()
        .map(|n| n.id.clone())
        .collect();
    Ok(HttpResponse::Ok().json(AnswerResponse {
        answer: outcome.answer,
        context_nodes: outcome.retrieved.nodes.iter().map(NodeView::from).collect(),
        context_edges: outcome.retrieved.edges.iter().map(EdgeView::from).collect(),
        retrieval_meta: RetrievalMeta {
            strategy: "hybrid".to_string(),
            chain: outcome.retrieved.chain,
        },
        contributing_ids,
    }))
}

pub async fn path(
    state: web::Data<std::sync::Arc<AppState>>,
    payload: web::Json<PathRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let body = payload.into_inner();
    if body.source_id.is_empty() || body.target_id.is_empty() {
        return Err(GraphError::InvalidInput(
            "source_id and target_id are required".to_string(),
        ));
    }
    let namespace = state.namespace_or_default(body.namespace.as_deref());
    let path = state
        .pathfinder
        .shortest_path(
            &body.source_id,
            &body.target_id,
            body.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            &namespace,
        )
        .await?;
    let edges = state.pathfinder.path_edges(&path, &namespace).await?;
    Ok(HttpResponse::Ok().json(PathResponse {
        path,
        edges: edges.iter().map(EdgeView::from).collect(),
    }))
}

/// Embedding-similar nodes, with a token-Jaccard fallback when the anchor
/// node has no embedding.
pub async fn similar(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<SimilarQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let top_k = params.top_k.unwrap_or(8);
    let target = state
        .store
        .sql()
        .get_node(&params.node_id)
        .await?
        .ok_or_else(|| GraphError::NotFound(format!("node {}", params.node_id)))?;

    let candidates = state
        .store
        .sql()
        .scan_nodes(&NodeFilter::namespace(&namespace))
        .await?;
    let mut scored: Vec<(f64, SimilarNode)> = Vec::new();
    if !target.embedding.is_empty() {
        for candidate in candidates {
            if candidate.id == target.id || candidate.embedding.is_empty() {
                continue;
            }
            let score = cosine(&target.embedding, &candidate.embedding);
            scored.push((
                score,
                SimilarNode {
                    id: candidate.id,
                    name: candidate.name,
                    label: candidate.label,
                    score: round4(score),
                },
            ));
        }
    } else {
        let base = name_tokens(&target.name);
        for candidate in candidates {
            if candidate.id == target.id {
                continue;
            }
            let other = name_tokens(&candidate.name);
            let intersection = base.intersection(&other).count();
            let union = base.union(&other).count().max(1);
            let score = intersection as f64 / union as f64;
            scored.push((
                score,
                SimilarNode {
                    id: candidate.id,
                    name: candidate.name,
                    label: candidate.label,
                    score: round4(score),
                },
            ));
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let similar: Vec<SimilarNode> = scored.into_iter().take(top_k).map(|(_, n)| n).collect();
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "node_id": params.node_id,
        "similar": similar,
    })))
}

fn name_tokens(name: &str) -> std::collections::HashSet<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_string())
        .collect()
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
