use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use super::{check_api_key, ensure_enabled};
use crate::errors::GraphResult;
use crate::models::requests::IndexRunRequest;
use crate::state::AppState;

/// Trigger a batch index run in the background.
pub async fn run(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    payload: web::Json<IndexRunRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let body = payload.into_inner();
    let namespace = state.namespace_or_default(body.namespace.as_deref());
    let orchestrator = state.orchestrator.clone();
    let ns = namespace.clone();
    let (dry_run, force) = (body.dry_run, body.force);
    tokio::spawn(async move {
        let outcome = orchestrator
            .orchestrate(&ns, force, dry_run, body.since.as_deref(), None)
            .await;
        tracing::info!(
            namespace = %ns,
            status = outcome.status.as_str(),
            "background index run finished"
        );
    });
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "accepted": true,
        "namespace": namespace,
        "dry_run": dry_run,
    })))
}

pub async fn status(state: web::Data<std::sync::Arc<AppState>>) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let latest = state.orchestrator.artifacts_dir().join("latest");
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": state.metrics.gauge("last_index_status"),
        "last_index_run_at": state.metrics.gauge("last_index_run_at"),
        "latest_dir": latest.exists().then(|| latest.display().to_string()),
    })))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

/// Tail of the most recent orchestrator log, when one exists.
pub async fn log(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<LogQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let lines = params.lines.unwrap_or(200).clamp(1, 2000);
    let log_path = state
        .orchestrator
        .artifacts_dir()
        .join("latest")
        .join("orchestrator.log");
    let body = match std::fs::read_to_string(&log_path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            format!("{}\n", all[start..].join("\n"))
        }
        Err(_) => String::new(),
    };
    Ok(HttpResponse::Ok().content_type("text/plain").body(body))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub format: Option<String>,
}

pub async fn metrics(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<MetricsQuery>,
) -> GraphResult<HttpResponse> {
    if params.format.as_deref() == Some("prom") {
        return Ok(HttpResponse::Ok()
            .content_type("text/plain")
            .body(state.metrics.render_prometheus()));
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "metrics": state.metrics.snapshot_json(),
    })))
}
