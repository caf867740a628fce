//! Batch index orchestrator.
//!
//! Single-writer, lock-guarded runs that stage artifact files under a
//! timestamped directory, import them idempotently, flip stale ingest-log
//! rows to indexed, maintain the `latest` pointer and prune old runs.
//! Marker files give external observers a consistent view of each run.

mod import;
mod pipeline;

pub use import::ImportSummary;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::metrics::{keys, MetricsRegistry};
use crate::models::IngestStatus;
use crate::services::extraction::Extractor;
use crate::store::SqlStore;

pub const LOCKFILE_NAME: &str = ".graphrag_index.lock";
const DEFAULT_KEEP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "DRY_RUN")]
    DryRun,
    #[serde(rename = "NOOP")]
    Noop,
    #[serde(rename = "LOCKED")]
    Locked,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "IMPORT_FAILED")]
    ImportFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::DryRun => "DRY_RUN",
            RunStatus::Noop => "NOOP",
            RunStatus::Locked => "LOCKED",
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
            RunStatus::ImportFailed => "IMPORT_FAILED",
        }
    }

    fn counter_key(&self) -> &'static str {
        match self {
            RunStatus::DryRun => "index_runs_dry_total",
            RunStatus::Noop => "index_runs_noop_total",
            RunStatus::Locked => "index_runs_locked_total",
            RunStatus::Success => "index_runs_success_total",
            RunStatus::Partial => "index_runs_partial_total",
            RunStatus::Failed => "index_runs_failed_total",
            RunStatus::ImportFailed => "index_runs_import_failed_total",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrchestrateOutcome {
    pub status: RunStatus,
    pub duration_s: f64,
    pub staging_dir: Option<String>,
    pub namespace: String,
    pub dry_run: bool,
    pub stale_docs: usize,
    pub total_docs: usize,
    pub error: Option<String>,
}

pub struct IndexOrchestrator {
    store: SqlStore,
    extractor: Arc<Extractor>,
    metrics: Arc<MetricsRegistry>,
    artifacts_dir: PathBuf,
    raw_docs_dir: PathBuf,
}

impl IndexOrchestrator {
    pub fn new(
        store: SqlStore,
        extractor: Arc<Extractor>,
        metrics: Arc<MetricsRegistry>,
        artifacts_dir: PathBuf,
        raw_docs_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            extractor,
            metrics,
            artifacts_dir,
            raw_docs_dir,
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub async fn orchestrate(
        &self,
        namespace: &str,
        force: bool,
        dry_run: bool,
        since: Option<&str>,
        keep: Option<usize>,
    ) -> OrchestrateOutcome {
        let started = Instant::now();
        let keep = keep.unwrap_or(DEFAULT_KEEP);
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let run_name = format!("run-{}", timestamp);
        let staging = self.artifacts_dir.join(&run_name);
        if let Err(e) = fs::create_dir_all(&self.artifacts_dir) {
            return self.finish(
                namespace,
                RunStatus::Failed,
                started,
                None,
                dry_run,
                0,
                0,
                Some(format!("artifacts dir unavailable: {}", e)),
            );
        }

        // Delta capture before anything else.
        let (total_docs, stale_doc_ids) = self.stale_docs(namespace).await;
        let stale_docs = stale_doc_ids.len();

        // Concurrency guard: one orchestrator run per machine.
        let lock = LockGuard::acquire(self.artifacts_dir.join(LOCKFILE_NAME));
        if lock.is_none() && !force {
            return self.finish(
                namespace,
                RunStatus::Locked,
                started,
                None,
                dry_run,
                stale_docs,
                total_docs,
                Some("another index run in progress".to_string()),
            );
        }

        if dry_run {
            return self.finish(
                namespace,
                RunStatus::DryRun,
                started,
                Some(staging.display().to_string()),
                dry_run,
                stale_docs,
                total_docs,
                None,
            );
        }

        // Delta short-circuit: nothing stale and not forced.
        if stale_docs == 0 && !force {
            return self.finish(
                namespace,
                RunStatus::Noop,
                started,
                None,
                dry_run,
                stale_docs,
                total_docs,
                None,
            );
        }

        if let Err(e) = fs::create_dir_all(&staging) {
            return self.finish(
                namespace,
                RunStatus::Failed,
                started,
                None,
                dry_run,
                stale_docs,
                total_docs,
                Some(format!("staging create failed: {}", e)),
            );
        }
        let _ = fs::write(staging.join("_RUNNING"), iso_now());

        // Generate artifacts: external CLI when configured, local fallback
        // extractor otherwise.
        let mut error = None;
        if let Err(e) = self.generate_artifacts(&staging, &stale_doc_ids, since).await {
            error = Some(e.to_string());
        }

        // Import whatever was produced.
        let status = match import::import_artifacts(&self.store, &staging, namespace).await {
            Ok(summary) => {
                if let Err(e) = self
                    .store
                    .mark_docs_indexed(namespace, &stale_doc_ids)
                    .await
                {
                    warn!("marking docs indexed failed: {}", e);
                }
                self.record_import_metrics(&summary);
                if summary.missing.iter().any(|m| m == "entities" || m == "relationships") {
                    let _ = fs::write(staging.join("_FAILED"), "core artifact missing");
                    RunStatus::Failed
                } else if !summary.missing.is_empty() {
                    let _ = fs::write(
                        staging.join("_PARTIAL"),
                        serde_json::to_string(&summary.missing).unwrap_or_default(),
                    );
                    RunStatus::Partial
                } else {
                    let _ = fs::write(staging.join("_SUCCESS"), "ok");
                    RunStatus::Success
                }
            }
            Err(e) => {
                error = Some(e.to_string());
                let _ = fs::write(staging.join("_FAILED"), format!("import failed: {}", e));
                RunStatus::ImportFailed
            }
        };

        if matches!(status, RunStatus::Success | RunStatus::Partial) {
            self.repoint_latest(&run_name);
        }
        prune_old_runs(&self.artifacts_dir, keep);

        self.finish(
            namespace,
            status,
            started,
            Some(staging.display().to_string()),
            dry_run,
            stale_docs,
            total_docs,
            error,
        )
    }

    async fn generate_artifacts(
        &self,
        staging: &Path,
        stale_doc_ids: &[String],
        since: Option<&str>,
    ) -> crate::errors::GraphResult<()> {
        if let Ok(cli) = std::env::var("GRAPHRAG_CLI") {
            if !cli.is_empty() {
                match self.run_external_cli(&cli, staging, since) {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("external index CLI failed, using fallback extractor: {}", e),
                }
            }
        }
        pipeline::run_fallback_pipeline(
            &self.extractor,
            &self.raw_docs_dir,
            staging,
            stale_doc_ids,
        )
        .await
    }

    fn run_external_cli(&self, cli: &str, staging: &Path, since: Option<&str>) -> std::io::Result<()> {
        let log = fs::File::create(staging.join("orchestrator.log"))?;
        let mut command = std::process::Command::new(cli);
        command.arg("index").arg("--output").arg(staging);
        if let Some(since) = since {
            command.arg("--since").arg(since);
        }
        let status = command
            .stdout(log.try_clone()?)
            .stderr(log)
            .status()?;
        if !status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("index CLI exited with {}", status),
            ));
        }
        Ok(())
    }

    async fn stale_docs(&self, namespace: &str) -> (usize, Vec<String>) {
        match self.store.ingest_log(namespace).await {
            Ok(rows) => {
                let stale: Vec<String> = rows
                    .iter()
                    .filter(|r| r.status == IngestStatus::Stale)
                    .map(|r| r.doc_id.clone())
                    .collect();
                (rows.len(), stale)
            }
            Err(e) => {
                warn!("ingest log read failed: {}", e);
                (0, Vec::new())
            }
        }
    }

    fn record_import_metrics(&self, summary: &ImportSummary) {
        let m = &self.metrics;
        m.set_gauge("last_index_entities_new", Value::from(summary.entities_new));
        m.set_gauge(
            "last_index_entities_merged",
            Value::from(summary.entities_merged),
        );
        m.set_gauge(
            "last_index_relationships_new",
            Value::from(summary.relationships_new),
        );
        m.set_gauge(
            "last_index_relationships_merged",
            Value::from(summary.relationships_merged),
        );
        m.set_gauge("last_index_delta_nodes", Value::from(summary.entities_new));
        m.set_gauge(
            "last_index_delta_edges",
            Value::from(summary.relationships_new),
        );
        let entity_total = summary.entities_new + summary.entities_merged;
        if entity_total > 0 {
            m.set_gauge(
                "last_index_percent_reused_nodes",
                Value::from(round6(summary.entities_merged as f64 / entity_total as f64)),
            );
        }
        let rel_total = summary.relationships_new + summary.relationships_merged;
        if rel_total > 0 {
            m.set_gauge(
                "last_index_percent_reused_edges",
                Value::from(round6(
                    summary.relationships_merged as f64 / rel_total as f64,
                )),
            );
        }
        m.set_gauge(
            "last_index_missing_optional",
            Value::from(summary.missing.len()),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        namespace: &str,
        status: RunStatus,
        started: Instant,
        staging_dir: Option<String>,
        dry_run: bool,
        stale_docs: usize,
        total_docs: usize,
        error: Option<String>,
    ) -> OrchestrateOutcome {
        let duration_s = round3(started.elapsed().as_secs_f64());
        let m = &self.metrics;
        m.set_gauge("last_index_run_at", Value::from(iso_now()));
        m.set_gauge("last_index_duration_s", Value::from(duration_s));
        m.set_gauge("last_index_status", Value::from(status.as_str()));
        m.set_gauge("last_index_stale_docs", Value::from(stale_docs));
        m.set_gauge("last_index_total_docs", Value::from(total_docs));
        m.incr(keys::INDEX_RUNS_TOTAL, 1);
        m.incr(status.counter_key(), 1);

        if let Some(err) = &error {
            error!(namespace, status = status.as_str(), "index run error: {}", err);
        } else {
            info!(namespace, status = status.as_str(), duration_s, "index run finished");
        }
        OrchestrateOutcome {
            status,
            duration_s,
            staging_dir,
            namespace: namespace.to_string(),
            dry_run,
            stale_docs,
            total_docs,
            error,
        }
    }

    /// Atomically repoint `artifacts/latest` at the new run via a relative
    /// symlink.
    fn repoint_latest(&self, run_name: &str) {
        let link = self.artifacts_dir.join("latest");
        if link.symlink_metadata().is_ok() {
            if link.is_dir() && !link.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                let _ = fs::remove_dir_all(&link);
            } else {
                let _ = fs::remove_file(&link);
            }
        }
        #[cfg(unix)]
        {
            if let Err(e) = std::os::unix::fs::symlink(run_name, &link) {
                warn!("latest symlink update failed: {}", e);
            }
        }
        #[cfg(not(unix))]
        {
            // Fall back to a pointer file on platforms without symlinks.
            if let Err(e) = fs::write(&link, run_name) {
                warn!("latest pointer update failed: {}", e);
            }
        }
    }
}

/// Advisory lock: exclusive lockfile creation, removed on drop.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: PathBuf) -> Option<Self> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Some(Self { path })
            }
            Err(_) => None,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn prune_old_runs(artifacts_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(artifacts_dir) else {
        return;
    };
    let mut runs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("run-"))
                    .unwrap_or(false)
        })
        .collect();
    runs.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    for old in runs.into_iter().skip(keep) {
        if let Err(e) = fs::remove_dir_all(&old) {
            warn!("run prune failed for {:?}: {}", old, e);
        }
    }
}

/// Optional periodic trigger; at most one instance per process.
pub fn spawn_scheduler(
    orchestrator: Arc<IndexOrchestrator>,
    namespace: String,
    interval_seconds: u64,
) {
    if interval_seconds == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let outcome = orchestrator.orchestrate(&namespace, false, false, None, None).await;
            info!(
                namespace = %namespace,
                status = outcome.status.as_str(),
                "scheduled index run"
            );
        }
    });
}

fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}
