use actix_web::{web, HttpResponse};

use super::ensure_enabled;
use crate::errors::GraphResult;
use crate::models::requests::{
    EdgeView, GraphViewQuery, LayoutRequest, NodeView, PageQuery, SearchQuery,
};
use crate::models::{EdgeFilter, NodeFilter};
use crate::services::layout::LayoutMode;
use crate::state::AppState;

const DEFAULT_SAMPLE: usize = 200;
const DEFAULT_PAGE: usize = 50;

/// Sampled nodes and edges for visualization, optionally restricted to a
/// viewport window over stored layout positions.
pub async fn graph_view(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<GraphViewQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let sample = params.sample.unwrap_or(DEFAULT_SAMPLE);

    let mut filter = NodeFilter::namespace(&namespace);
    if let Some(label) = &params.label {
        filter = filter.with_labels(vec![label.clone()]);
    }
    let nodes = if params.mode.as_deref() == Some("viewport") {
        match (params.x, params.y) {
            (Some(x), Some(y)) => {
                let wx = params.wx.unwrap_or(2.0);
                let wy = params.wy.unwrap_or(2.0);
                let all = state.store.sql().scan_nodes(&filter).await?;
                all.into_iter()
                    .filter(|n| {
                        n.layout_xy()
                            .map(|(nx, ny)| {
                                nx >= x - wx / 2.0
                                    && nx <= x + wx / 2.0
                                    && ny >= y - wy / 2.0
                                    && ny <= y + wy / 2.0
                            })
                            .unwrap_or(false)
                    })
                    .take(sample)
                    .collect()
            }
            _ => {
                state
                    .store
                    .sql()
                    .scan_nodes(&filter.with_limit(sample as i64))
                    .await?
            }
        }
    } else {
        state
            .store
            .sql()
            .scan_nodes(&filter.with_limit(sample as i64))
            .await?
    };

    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let mut edges = Vec::new();
    if !ids.is_empty() {
        let mut edge_filter = EdgeFilter::namespace(&namespace)
            .with_touching(ids)
            .with_limit(sample as i64);
        if let Some(relation) = &params.relation {
            edge_filter = edge_filter.with_relations(vec![relation.clone()]);
        }
        edges = state.store.sql().scan_edges(&edge_filter).await?;
    }

    // Growth check piggybacks on visualization reads.
    state.clusters.trigger_background_recompute(&namespace);

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "nodes": nodes.iter().map(NodeView::from).collect::<Vec<_>>(),
        "edges": edges.iter().map(EdgeView::from).collect::<Vec<_>>(),
        "namespace": namespace,
    })))
}

pub async fn list_nodes(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<PageQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, 500);

    let mut filter = NodeFilter::namespace(&namespace);
    if let Some(label) = &params.label {
        filter = filter.with_labels(vec![label.clone()]);
    }
    if let Some(search) = &params.search {
        filter = filter.with_name_contains(search);
    }
    let all = state.store.sql().scan_nodes(&filter).await?;

    // Cursor is the last node id of the previous page; the scan is id-ordered.
    let mut started = params.cursor.is_none();
    let mut page = Vec::new();
    for node in &all {
        if !started {
            if Some(&node.id) == params.cursor.as_ref() {
                started = true;
            }
            continue;
        }
        page.push(node);
        if page.len() == limit {
            break;
        }
    }
    let next_cursor = if page.len() == limit {
        page.last().map(|n| n.id.clone())
    } else {
        None
    };
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "nodes": page.iter().map(|n| NodeView::from(*n)).collect::<Vec<_>>(),
        "cursor": next_cursor,
        "namespace": namespace,
    })))
}

pub async fn list_edges(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<PageQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, 500);

    let mut filter = EdgeFilter::namespace(&namespace);
    if let Some(relation) = &params.relation {
        filter = filter.with_relations(vec![relation.clone()]);
    }
    let all = state.store.sql().scan_edges(&filter).await?;

    let mut started = params.cursor.is_none();
    let mut page = Vec::new();
    for edge in &all {
        if !started {
            if Some(&edge.id) == params.cursor.as_ref() {
                started = true;
            }
            continue;
        }
        page.push(edge);
        if page.len() == limit {
            break;
        }
    }
    let next_cursor = if page.len() == limit {
        page.last().map(|e| e.id.clone())
    } else {
        None
    };
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "edges": page.iter().map(|e| EdgeView::from(*e)).collect::<Vec<_>>(),
        "cursor": next_cursor,
        "namespace": namespace,
    })))
}

/// Name-prefix search for UI autocomplete.
pub async fn search(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<SearchQuery>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let limit = params.limit.unwrap_or(25);
    let needle = params.q.to_lowercase();
    let hits = state
        .store
        .sql()
        .scan_nodes(&NodeFilter::default().with_name_contains(&params.q))
        .await?;
    let results: Vec<_> = hits
        .iter()
        .filter(|n| n.name.to_lowercase().starts_with(&needle))
        .take(limit)
        .map(|n| {
            serde_json::json!({
                "id": n.id,
                "name": n.name,
                "label": n.label,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(serde_json::json!({ "results": results })))
}

pub async fn namespaces(
    state: web::Data<std::sync::Arc<AppState>>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let mut namespaces = state.store.sql().distinct_namespaces().await?;
    if !namespaces.contains(&state.config.default_namespace) {
        namespaces.push(state.config.default_namespace.clone());
        namespaces.sort();
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({ "namespaces": namespaces })))
}

pub async fn stats(
    state: web::Data<std::sync::Arc<AppState>>,
    params: web::Query<LayoutRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(params.namespace.as_deref());
    let nodes = state.store.sql().count_nodes(&namespace).await?;
    let edges = state.store.sql().count_edges(&namespace).await?;
    let indexed_docs = state.store.sql().count_indexed_docs(&namespace).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "namespace": namespace,
        "nodes": nodes,
        "edges": edges,
        "indexed_docs": indexed_docs,
        "store": state.store.backend_name(),
    })))
}

pub async fn recompute_layout(
    state: web::Data<std::sync::Arc<AppState>>,
    payload: web::Json<LayoutRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(payload.namespace.as_deref());
    let mode = LayoutMode::parse(payload.mode.as_deref().unwrap_or("hybrid"));
    let outcome = state.layout.recompute_layout(&namespace, mode).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn centrality(
    state: web::Data<std::sync::Arc<AppState>>,
    payload: web::Json<LayoutRequest>,
) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let namespace = state.namespace_or_default(payload.namespace.as_deref());
    let outcome = state.layout.compute_centrality(&namespace).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

