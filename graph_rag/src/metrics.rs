//! Process-wide metrics registry.
//!
//! Counters, latency sums and last-index gauges, rendered either as a JSON
//! object (with derived averages) or as Prometheus text. Passed around as an
//! explicit constructor dependency, never a global.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub mod keys {
    pub const INGEST_COUNT: &str = "ingest_count";
    pub const NODES_CREATED: &str = "nodes_created";
    pub const EDGES_CREATED: &str = "edges_created";
    pub const RETRIEVAL_REQUESTS: &str = "retrieval_requests";
    pub const ANSWER_REQUESTS: &str = "answer_requests";
    pub const SNAPSHOTS_CREATED: &str = "snapshots_created";
    pub const STREAM_SUBSCRIBERS: &str = "stream_subscribers";
    pub const INDEX_RUNS_TOTAL: &str = "index_runs_total";
    pub const ARTIFACT_CACHE_HITS: &str = "artifact_cache_hits";
    pub const ARTIFACT_CACHE_MISSES: &str = "artifact_cache_misses";
    pub const ARTIFACT_CACHE_RELOADS: &str = "artifact_cache_reload_count";

    pub const INGEST_LATENCY: &str = "ingest_latency";
    pub const RETRIEVAL_LATENCY: &str = "retrieval_latency";
    pub const ANSWER_LATENCY: &str = "answer_latency";
    pub const QUERY2_LATENCY: &str = "query2_latency";
}

#[derive(Default)]
struct MetricsInner {
    counters: BTreeMap<String, u64>,
    /// key -> (sum_seconds, count)
    latencies: BTreeMap<String, (f64, u64)>,
    gauges: BTreeMap<String, Value>,
    namespace_docs: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    inner: RwLock<MetricsInner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, key: &str, by: u64) {
        let mut inner = self.inner.write();
        *inner.counters.entry(key.to_string()).or_insert(0) += by;
    }

    pub fn decr_floor_zero(&self, key: &str) {
        let mut inner = self.inner.write();
        let v = inner.counters.entry(key.to_string()).or_insert(0);
        *v = v.saturating_sub(1);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner.read().counters.get(key).copied().unwrap_or(0)
    }

    pub fn observe_latency(&self, key: &str, seconds: f64) {
        let mut inner = self.inner.write();
        let entry = inner.latencies.entry(key.to_string()).or_insert((0.0, 0));
        entry.0 += seconds;
        entry.1 += 1;
    }

    pub fn set_gauge(&self, key: &str, value: Value) {
        self.inner.write().gauges.insert(key.to_string(), value);
    }

    pub fn gauge(&self, key: &str) -> Option<Value> {
        self.inner.read().gauges.get(key).cloned()
    }

    pub fn incr_namespace_docs(&self, namespace: &str) {
        let mut inner = self.inner.write();
        *inner
            .namespace_docs
            .entry(namespace.to_string())
            .or_insert(0) += 1;
    }

    pub fn reset_counters(&self) {
        let mut inner = self.inner.write();
        inner.counters.clear();
        inner.latencies.clear();
        inner.namespace_docs.clear();
    }

    /// Full JSON view with derived averages and cache hit rate.
    pub fn snapshot_json(&self) -> Value {
        let inner = self.inner.read();
        let mut out = Map::new();
        for (k, v) in &inner.counters {
            out.insert(k.clone(), Value::from(*v));
        }
        for (k, (sum, count)) in &inner.latencies {
            out.insert(format!("{}_sum", k), Value::from(*sum));
            out.insert(format!("{}_count", k), Value::from(*count));
            if *count > 0 {
                out.insert(
                    format!("avg_{}", k),
                    Value::from(round6(sum / *count as f64)),
                );
            }
        }
        for (k, v) in &inner.gauges {
            out.insert(k.clone(), v.clone());
        }
        let hits = inner.counters.get(keys::ARTIFACT_CACHE_HITS).copied().unwrap_or(0);
        let misses = inner
            .counters
            .get(keys::ARTIFACT_CACHE_MISSES)
            .copied()
            .unwrap_or(0);
        if hits + misses > 0 {
            out.insert(
                "artifact_cache_hit_rate".to_string(),
                Value::from(round6(hits as f64 / (hits + misses) as f64)),
            );
        }
        out.insert(
            "namespace_docs".to_string(),
            Value::Object(
                inner
                    .namespace_docs
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(*v)))
                    .collect(),
            ),
        );
        Value::Object(out)
    }

    /// Prometheus exposition: numeric series only.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.read();
        let mut lines = Vec::new();
        for (k, v) in &inner.counters {
            lines.push(format!("graphrag_{} {}", k, v));
        }
        for (k, (sum, count)) in &inner.latencies {
            lines.push(format!("graphrag_{}_sum {}", k, sum));
            lines.push(format!("graphrag_{}_count {}", k, count));
        }
        for (k, v) in &inner.gauges {
            if let Some(n) = v.as_f64() {
                lines.push(format!("graphrag_{} {}", k, n));
            }
        }
        for (ns, v) in &inner.namespace_docs {
            lines.push(format!("graphrag_namespace_docs{{namespace=\"{}\"}} {}", ns, v));
        }
        let mut body = lines.join("\n");
        body.push('\n');
        body
    }
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_latency_averages() {
        let m = MetricsRegistry::new();
        m.incr(keys::INGEST_COUNT, 1);
        m.incr(keys::INGEST_COUNT, 1);
        m.observe_latency(keys::INGEST_LATENCY, 0.2);
        m.observe_latency(keys::INGEST_LATENCY, 0.4);

        let snap = m.snapshot_json();
        assert_eq!(snap["ingest_count"], 2);
        assert_eq!(snap["ingest_latency_count"], 2);
        let avg = snap["avg_ingest_latency"].as_f64().unwrap();
        assert!((avg - 0.3).abs() < 1e-9);
    }

    #[test]
    fn prometheus_rendering_skips_string_gauges() {
        let m = MetricsRegistry::new();
        m.incr(keys::INDEX_RUNS_TOTAL, 1);
        m.set_gauge("last_index_status", Value::from("SUCCESS"));
        m.set_gauge("last_index_duration_s", Value::from(1.5));
        let prom = m.render_prometheus();
        assert!(prom.contains("graphrag_index_runs_total 1"));
        assert!(prom.contains("graphrag_last_index_duration_s 1.5"));
        assert!(!prom.contains("SUCCESS"));
    }
}
