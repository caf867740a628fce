use actix_web::{web, HttpRequest, HttpResponse};

use super::{check_api_key, ensure_enabled};
use crate::errors::GraphResult;
use crate::models::requests::{IngestBatchRequest, IngestRequest, IngestResponse};
use crate::state::AppState;

pub async fn ingest(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    payload: web::Json<IngestRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let outcome = state.ingestor.ingest_document(payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(IngestResponse {
        success: outcome.success,
        doc_id: outcome.doc_id,
        namespace: outcome.namespace,
        extraction: outcome.extraction,
        stats: outcome.stats,
    }))
}

pub async fn ingest_batch(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    payload: web::Json<IngestBatchRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let mut results = Vec::new();
    for item in payload.into_inner().items {
        match state.ingestor.ingest_document(item).await {
            Ok(outcome) => results.push(serde_json::json!({
                "success": outcome.success,
                "doc_id": outcome.doc_id,
                "namespace": outcome.namespace,
                "stats": outcome.stats,
            })),
            // One bad document must not abort the rest of the batch.
            Err(e) => results.push(serde_json::json!({
                "success": false,
                "error": e.to_string(),
                "category": e.category(),
            })),
        }
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({ "results": results })))
}

pub async fn reset(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    state.store.sql().bulk_reset().await?;
    state.metrics.reset_counters();
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}
