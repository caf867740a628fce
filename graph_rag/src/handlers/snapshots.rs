use actix_web::{web, HttpRequest, HttpResponse};

use super::{check_api_key, ensure_enabled};
use crate::errors::GraphResult;
use crate::models::requests::{SnapshotDiffQuery, SnapshotQuery};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: i64 = 25;

pub async fn create(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    params: web::Query<SnapshotQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let snapshot = state.snapshots.create_snapshot(&namespace).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "snapshot_id": snapshot.id,
        "node_count": snapshot.node_count,
        "edge_count": snapshot.edge_count,
        "modularity": snapshot.modularity,
    })))
}

pub async fn list(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<SnapshotQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let snapshots = state
        .snapshots
        .list_snapshots(&namespace, params.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    let rows: Vec<_> = snapshots
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "created_at": s.created_at.to_rfc3339(),
                "node_count": s.node_count,
                "edge_count": s.edge_count,
                "modularity": s.modularity,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(serde_json::json!({ "snapshots": rows })))
}

pub async fn diff(
    state: web::Data<std::sync::Arc<AppState>>,
    req: HttpRequest,
    params: web::Query<SnapshotDiffQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    check_api_key(&state, &req)?;
    let delta = state.snapshots.diff_snapshots(&params.a, &params.b).await?;
    Ok(HttpResponse::Ok().json(delta))
}
