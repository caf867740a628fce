//! HTTP surface: route table, feature/API-key guards, and one module per
//! endpoint group.

pub mod cluster;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod query;
pub mod snapshots;
pub mod stream;

use actix_web::{web, HttpRequest, HttpResponse};

use crate::errors::{GraphError, GraphResult};
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/graphrag")
            // Ingestion
            .route("/ingest", web::post().to(ingest::ingest))
            .route("/ingest-batch", web::post().to(ingest::ingest_batch))
            .route("/reset", web::post().to(ingest::reset))
            // Retrieval & question answering
            .route("/query", web::post().to(query::query))
            .route("/query2", web::post().to(query::query2))
            .route("/answer", web::post().to(query::answer))
            .route("/path", web::post().to(query::path))
            .route("/similar", web::get().to(query::similar))
            // Graph browsing
            .route("/graph", web::get().to(graph::graph_view))
            .route("/nodes", web::get().to(graph::list_nodes))
            .route("/edges", web::get().to(graph::list_edges))
            .route("/search", web::get().to(graph::search))
            .route("/namespaces", web::get().to(graph::namespaces))
            .route("/stats", web::get().to(graph::stats))
            .route("/recompute-layout", web::post().to(graph::recompute_layout))
            .route("/centrality", web::post().to(graph::centrality))
            // Clusters
            .route("/cluster", web::get().to(cluster::get_clusters))
            .route("/cluster/summarize", web::post().to(cluster::summarize))
            // Snapshots
            .route("/snapshots", web::post().to(snapshots::create))
            .route("/snapshots", web::get().to(snapshots::list))
            .route("/snapshots/diff", web::get().to(snapshots::diff))
            // Index orchestration
            .route("/index/run", web::post().to(index::run))
            .route("/index/status", web::get().to(index::status))
            .route("/index/log", web::get().to(index::log))
            // Observability
            .route("/metrics", web::get().to(index::metrics))
            .route("/stream", web::get().to(stream::stream)),
    )
    .route("/health", web::get().to(health));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "graph_rag",
    }))
}

/// Feature flag gate: disabled means no side effects at all.
pub fn ensure_enabled(state: &AppState) -> GraphResult<()> {
    if state.config.enable_graphrag {
        Ok(())
    } else {
        Err(GraphError::Disabled)
    }
}

/// Optional API-key guard for mutating/guarded endpoints.
pub fn check_api_key(state: &AppState, req: &HttpRequest) -> GraphResult<()> {
    if state.config.graphrag_api_key.is_empty() {
        return Ok(());
    }
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided == state.config.graphrag_api_key {
        Ok(())
    } else {
        Err(GraphError::Unauthorized("invalid or missing API key".to_string()))
    }
}
