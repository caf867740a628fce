use actix_web::{web, HttpResponse};

use super::ensure_enabled;
use crate::errors::{GraphError, GraphResult};
use crate::models::requests::{ClusterQuery, SummarizeRequest};
use crate::state::AppState;

pub async fn get_clusters(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<ClusterQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let result = state.clusters.get_clusters(&namespace, params.force).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn summarize(
    state: web::Data<std::sync::Arc<AppState>>,
    payload: web::Json<SummarizeRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let body = payload.into_inner();
    if body.cluster_ids.is_empty() {
        return Err(GraphError::InvalidInput("cluster_ids is empty".to_string()));
    }
    let namespace = state.namespace_or_default(body.namespace.as_deref());
    let max_tokens = body
        .max_tokens
        .unwrap_or(state.config.cluster_summary_max_tokens_per);
    let summaries = state
        .clusters
        .summarize_clusters(&namespace, &body.cluster_ids, max_tokens)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "namespace": namespace,
        "summaries": summaries,
    })))
}
