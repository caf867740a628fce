use actix_web::{web, HttpResponse};
use std::sync::Arc;

use super::ensure_enabled;
use crate::errors::GraphResult;
use crate::metrics::{keys, MetricsRegistry};
use crate::state::AppState;

/// Server-Sent Events stream of incremental graph updates.
///
/// Each connection owns a bounded queue; the subscriber entry is pruned by
/// the bus once the connection drops, and the gauge is corrected by the
/// stream guard.
pub async fn stream(state: web::Data<Arc<AppState>>) -> GraphResult<HttpResponse> {
    ensure_enabled(&state)?;
    let mut rx = state.events.subscribe();
    state.metrics.incr(keys::STREAM_SUBSCRIBERS, 1);
    let guard = SubscriberGuard {
        metrics: state.metrics.clone(),
    };

    let body = async_stream::stream! {
        let _guard = guard;
        yield Ok::<web::Bytes, actix_web::Error>(web::Bytes::from_static(b": connected\n\n"));
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string());
            let frame = format!("event: {}\ndata: {}\n\n", event.event, data);
            yield Ok(web::Bytes::from(frame));
        }
    };

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(body))
}

struct SubscriberGuard {
    metrics: Arc<MetricsRegistry>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.metrics.decr_floor_zero(keys::STREAM_SUBSCRIBERS);
    }
}
