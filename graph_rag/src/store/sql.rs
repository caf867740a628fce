//! Relational store: single-writer SQL with JSON columns.
//!
//! All graph state lives in six tables (nodes, edges, cluster memberships,
//! cluster summaries, snapshots, ingest log). JSON-valued columns are
//! serialized as TEXT. Every write path sets both the denormalized
//! `namespace` column and `properties.namespace`, so the two never diverge.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

use crate::errors::{GraphError, GraphResult};
use crate::models::{
    ClusterMembership, ClusterSummary, EdgeFilter, EndpointRef, GraphEdge, GraphNode,
    GraphSnapshot, IngestBatch, IngestLogEntry, IngestStats, IngestStatus, NodeFilter,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS graphrag_nodes (
    id          TEXT PRIMARY KEY,
    label       TEXT NOT NULL,
    name        TEXT NOT NULL,
    properties  TEXT NOT NULL DEFAULT '{}',
    source_ids  TEXT NOT NULL DEFAULT '[]',
    embedding   TEXT NOT NULL DEFAULT '[]',
    namespace   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_namespace ON graphrag_nodes(namespace);
CREATE INDEX IF NOT EXISTS idx_nodes_label ON graphrag_nodes(label);
CREATE INDEX IF NOT EXISTS idx_nodes_name ON graphrag_nodes(name);

CREATE TABLE IF NOT EXISTS graphrag_edges (
    id          TEXT PRIMARY KEY,
    source_id   TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    relation    TEXT NOT NULL,
    confidence  REAL NOT NULL DEFAULT 0.5,
    properties  TEXT NOT NULL DEFAULT '{}',
    namespace   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_edges_source ON graphrag_edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON graphrag_edges(target_id);
CREATE INDEX IF NOT EXISTS idx_edges_namespace ON graphrag_edges(namespace);
CREATE INDEX IF NOT EXISTS idx_edges_relation ON graphrag_edges(relation);

CREATE TABLE IF NOT EXISTS graphrag_cluster_memberships (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id     TEXT NOT NULL,
    cluster_id  TEXT NOT NULL,
    namespace   TEXT NOT NULL,
    algorithm   TEXT NOT NULL DEFAULT 'louvain',
    score       REAL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memberships_ns_algo
    ON graphrag_cluster_memberships(namespace, algorithm);

CREATE TABLE IF NOT EXISTS graphrag_cluster_summaries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id      TEXT NOT NULL,
    namespace       TEXT NOT NULL,
    algorithm       TEXT NOT NULL DEFAULT 'louvain',
    top_terms_hash  TEXT NOT NULL DEFAULT '',
    label           TEXT NOT NULL DEFAULT '',
    summary         TEXT NOT NULL DEFAULT '',
    token_count     INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_lookup
    ON graphrag_cluster_summaries(namespace, cluster_id, algorithm);

CREATE TABLE IF NOT EXISTS graphrag_snapshots (
    id          TEXT PRIMARY KEY,
    namespace   TEXT NOT NULL,
    node_count  INTEGER NOT NULL,
    edge_count  INTEGER NOT NULL,
    modularity  REAL,
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_namespace ON graphrag_snapshots(namespace);

CREATE TABLE IF NOT EXISTS graphrag_ingest_log (
    id              TEXT PRIMARY KEY,
    namespace       TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'ingested',
    first_seen_at   TEXT NOT NULL,
    last_ingest_at  TEXT NOT NULL,
    last_indexed_at TEXT,
    meta            TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_ingest_log_ns ON graphrag_ingest_log(namespace);
CREATE INDEX IF NOT EXISTS idx_ingest_log_status ON graphrag_ingest_log(status);
"#;

#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub async fn connect(database_url: &str) -> GraphResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| GraphError::Internal(format!("bad database url: {}", e)))?
            .create_if_missing(true);
        // One connection: SQLite is single-writer, and an in-memory database
        // exists per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn in_memory() -> GraphResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_schema(&self) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------- nodes ----------------------

    /// Merge-upsert: shallow property merge, embedding filled only when
    /// previously empty, source_ids unioned.
    pub async fn upsert_nodes(&self, nodes: &[GraphNode]) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        for node in nodes {
            upsert_node_tx(&mut tx, node).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_edges(&self, edges: &[GraphEdge]) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        for edge in edges {
            insert_edge_tx(&mut tx, edge).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> GraphResult<Option<GraphNode>> {
        let row = sqlx::query("SELECT * FROM graphrag_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_node(&r)).transpose()
    }

    pub async fn scan_nodes(&self, filter: &NodeFilter) -> GraphResult<Vec<GraphNode>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM graphrag_nodes WHERE 1=1");
        if let Some(ns) = &filter.namespace {
            qb.push(" AND namespace = ").push_bind(ns.clone());
        }
        if let Some(labels) = &filter.labels {
            qb.push(" AND label IN (");
            let mut sep = qb.separated(", ");
            for l in labels {
                sep.push_bind(l.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(needle) = &filter.name_contains {
            qb.push(" AND lower(name) LIKE ")
                .push_bind(format!("%{}%", needle.to_lowercase()));
        }
        qb.push(" ORDER BY id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_node).collect()
    }

    pub async fn scan_edges(&self, filter: &EdgeFilter) -> GraphResult<Vec<GraphEdge>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM graphrag_edges WHERE 1=1");
        if let Some(ns) = &filter.namespace {
            qb.push(" AND namespace = ").push_bind(ns.clone());
        }
        if let Some(relations) = &filter.relations {
            qb.push(" AND relation IN (");
            let mut sep = qb.separated(", ");
            for r in relations {
                sep.push_bind(r.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(ids) = &filter.touching {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND (source_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
            qb.push(" OR target_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated("))");
        }
        qb.push(" ORDER BY id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_edge).collect()
    }

    pub async fn count_nodes(&self, namespace: &str) -> GraphResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM graphrag_nodes WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c"))
    }

    pub async fn count_edges(&self, namespace: &str) -> GraphResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM graphrag_edges WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c"))
    }

    pub async fn distinct_namespaces(&self) -> GraphResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT namespace FROM graphrag_nodes ORDER BY namespace")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("namespace")).collect())
    }

    /// Batch property writeback used by layout and centrality passes.
    pub async fn write_node_properties(
        &self,
        updates: &[(String, Map<String, Value>)],
    ) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        for (id, props) in updates {
            sqlx::query("UPDATE graphrag_nodes SET properties = ?, updated_at = ? WHERE id = ?")
                .bind(serde_json::to_string(props)?)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomic purge of a document's chunk and section nodes plus every edge
    /// touching them.
    pub async fn delete_doc_scoped(&self, doc_id: &str) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        purge_doc_tx(&mut tx, doc_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Wipe every graph table. Only the explicit reset endpoint calls this.
    pub async fn bulk_reset(&self) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "graphrag_edges",
            "graphrag_nodes",
            "graphrag_cluster_memberships",
            "graphrag_cluster_summaries",
            "graphrag_snapshots",
            "graphrag_ingest_log",
        ] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---------------------- ingest transaction ----------------------

    /// Apply one ingest's full write set in a single transaction:
    /// purge -> chunks -> entity dedup/insert -> sections -> edges.
    pub async fn apply_ingest(&self, batch: IngestBatch) -> GraphResult<IngestStats> {
        let mut stats = IngestStats {
            store: "relational".to_string(),
            ..Default::default()
        };
        let mut tx = self.pool.begin().await?;

        purge_doc_tx(&mut tx, &batch.doc_id).await?;

        for chunk in &batch.chunks {
            insert_node_tx(&mut tx, chunk).await?;
            stats.nodes += 1;
        }
        for section in &batch.sections {
            insert_node_tx(&mut tx, section).await?;
            stats.nodes += 1;
        }

        // Entity dedup: conflict on (lower(name), namespace) means merge.
        let mut canonical: HashMap<String, String> = HashMap::new();
        for entity in &batch.entities {
            let key = entity.name.to_lowercase();
            if canonical.contains_key(&key) {
                continue;
            }
            let existing = sqlx::query(
                "SELECT * FROM graphrag_nodes WHERE namespace = ? AND lower(name) = ? LIMIT 1",
            )
            .bind(&batch.namespace)
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?;
            match existing {
                Some(row) => {
                    let mut node = row_to_node(&row)?;
                    merge_node(&mut node, entity);
                    update_node_tx(&mut tx, &node).await?;
                    canonical.insert(key, node.id);
                    stats.entities_merged += 1;
                }
                None => {
                    insert_node_tx(&mut tx, entity).await?;
                    canonical.insert(key, entity.id.clone());
                    stats.nodes += 1;
                }
            }
        }

        for pending in &batch.edges {
            let source = resolve_endpoint(&pending.source, &canonical);
            let target = resolve_endpoint(&pending.target, &canonical);
            let (Some(source_id), Some(target_id)) = (source, target) else {
                continue;
            };
            // Entity-to-entity edges survive the doc purge; re-ingesting the
            // same text must not duplicate them.
            let exists = sqlx::query(
                "SELECT id FROM graphrag_edges
                 WHERE namespace = ? AND source_id = ? AND target_id = ? AND relation = ? LIMIT 1",
            )
            .bind(&batch.namespace)
            .bind(&source_id)
            .bind(&target_id)
            .bind(&pending.relation)
            .fetch_optional(&mut *tx)
            .await?;
            if exists.is_some() {
                continue;
            }
            let edge = GraphEdge::new(
                source_id,
                target_id,
                &pending.relation,
                pending.confidence,
                &batch.namespace,
            );
            insert_edge_tx(&mut tx, &edge).await?;
            stats.edges += 1;
        }

        tx.commit().await?;
        debug!(
            doc_id = %batch.doc_id,
            nodes = stats.nodes,
            edges = stats.edges,
            merged = stats.entities_merged,
            "ingest batch committed"
        );
        Ok(stats)
    }

    // ---------------------- artifact import merges ----------------------

    /// Merge an artifact entity by id or `(lower(name), namespace)`.
    /// Returns true when a new row was inserted.
    pub async fn merge_artifact_entity(&self, node: &GraphNode) -> GraphResult<bool> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT * FROM graphrag_nodes WHERE namespace = ? AND (id = ? OR lower(name) = ?) LIMIT 1",
        )
        .bind(&node.namespace)
        .bind(&node.id)
        .bind(node.name.to_lowercase())
        .fetch_optional(&mut *tx)
        .await?;
        let inserted = match existing {
            Some(row) => {
                let mut target = row_to_node(&row)?;
                // Preserve existing embedding; fill only when empty.
                merge_node(&mut target, node);
                update_node_tx(&mut tx, &target).await?;
                false
            }
            None => {
                insert_node_tx(&mut tx, node).await?;
                true
            }
        };
        tx.commit().await?;
        Ok(inserted)
    }

    /// Merge an artifact relationship on `(source, target, relation, ns)`,
    /// upgrading confidence to the max of existing and incoming.
    pub async fn merge_artifact_edge(&self, edge: &GraphEdge) -> GraphResult<bool> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT * FROM graphrag_edges
             WHERE namespace = ? AND source_id = ? AND target_id = ? AND relation = ? LIMIT 1",
        )
        .bind(&edge.namespace)
        .bind(&edge.source_id)
        .bind(&edge.target_id)
        .bind(&edge.relation)
        .fetch_optional(&mut *tx)
        .await?;
        let inserted = match existing {
            Some(row) => {
                let current = row_to_edge(&row)?;
                let confidence = current.confidence.max(edge.confidence);
                let mut props = current.properties.clone();
                for (k, v) in &edge.properties {
                    props.entry(k.clone()).or_insert_with(|| v.clone());
                }
                sqlx::query(
                    "UPDATE graphrag_edges SET confidence = ?, properties = ?, updated_at = ? WHERE id = ?",
                )
                .bind(confidence)
                .bind(serde_json::to_string(&props)?)
                .bind(Utc::now().to_rfc3339())
                .bind(&current.id)
                .execute(&mut *tx)
                .await?;
                false
            }
            None => {
                insert_edge_tx(&mut tx, edge).await?;
                true
            }
        };
        tx.commit().await?;
        Ok(inserted)
    }

    // ---------------------- cluster memberships ----------------------

    pub async fn replace_memberships(
        &self,
        namespace: &str,
        algorithm: &str,
        memberships: &[ClusterMembership],
    ) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM graphrag_cluster_memberships WHERE namespace = ? AND algorithm = ?")
            .bind(namespace)
            .bind(algorithm)
            .execute(&mut *tx)
            .await?;
        let now = Utc::now().to_rfc3339();
        for m in memberships {
            sqlx::query(
                "INSERT INTO graphrag_cluster_memberships
                 (node_id, cluster_id, namespace, algorithm, score, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&m.node_id)
            .bind(&m.cluster_id)
            .bind(&m.namespace)
            .bind(&m.algorithm)
            .bind(m.score)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn memberships(
        &self,
        namespace: &str,
        algorithm: &str,
    ) -> GraphResult<Vec<ClusterMembership>> {
        let rows = sqlx::query(
            "SELECT * FROM graphrag_cluster_memberships WHERE namespace = ? AND algorithm = ?",
        )
        .bind(namespace)
        .bind(algorithm)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ClusterMembership {
                node_id: r.get("node_id"),
                cluster_id: r.get("cluster_id"),
                namespace: r.get("namespace"),
                algorithm: r.get("algorithm"),
                score: r.get("score"),
            })
            .collect())
    }

    /// Insert membership unless `(node_id, cluster_id, namespace)` exists for
    /// the algorithm. Returns true on insert.
    pub async fn add_membership_if_absent(&self, m: &ClusterMembership) -> GraphResult<bool> {
        let existing = sqlx::query(
            "SELECT id FROM graphrag_cluster_memberships
             WHERE node_id = ? AND cluster_id = ? AND namespace = ? AND algorithm = ? LIMIT 1",
        )
        .bind(&m.node_id)
        .bind(&m.cluster_id)
        .bind(&m.namespace)
        .bind(&m.algorithm)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO graphrag_cluster_memberships
             (node_id, cluster_id, namespace, algorithm, score, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&m.node_id)
        .bind(&m.cluster_id)
        .bind(&m.namespace)
        .bind(&m.algorithm)
        .bind(m.score)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    // ---------------------- cluster summaries ----------------------

    pub async fn find_summary(
        &self,
        namespace: &str,
        cluster_id: &str,
        algorithm: &str,
        top_terms_hash: Option<&str>,
    ) -> GraphResult<Option<ClusterSummary>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT * FROM graphrag_cluster_summaries WHERE namespace = ",
        );
        qb.push_bind(namespace);
        qb.push(" AND cluster_id = ").push_bind(cluster_id);
        qb.push(" AND algorithm = ").push_bind(algorithm);
        if let Some(hash) = top_terms_hash {
            qb.push(" AND top_terms_hash = ").push_bind(hash);
        }
        qb.push(" ORDER BY id DESC LIMIT 1");
        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.map(|r| ClusterSummary {
            cluster_id: r.get("cluster_id"),
            namespace: r.get("namespace"),
            algorithm: r.get("algorithm"),
            top_terms_hash: r.get("top_terms_hash"),
            label: r.get("label"),
            summary: r.get("summary"),
            token_count: r.get("token_count"),
        }))
    }

    pub async fn insert_summary(&self, s: &ClusterSummary) -> GraphResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO graphrag_cluster_summaries
             (cluster_id, namespace, algorithm, top_terms_hash, label, summary, token_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&s.cluster_id)
        .bind(&s.namespace)
        .bind(&s.algorithm)
        .bind(&s.top_terms_hash)
        .bind(&s.label)
        .bind(&s.summary)
        .bind(s.token_count)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Community-report import: insert if absent; refresh only an empty summary.
    pub async fn upsert_report(
        &self,
        namespace: &str,
        cluster_id: &str,
        label: &str,
        summary: &str,
    ) -> GraphResult<bool> {
        let existing = self
            .find_summary(namespace, cluster_id, "graphrag", None)
            .await?;
        match existing {
            Some(s) if s.summary.is_empty() && !summary.is_empty() => {
                sqlx::query(
                    "UPDATE graphrag_cluster_summaries SET label = ?, summary = ?, updated_at = ?
                     WHERE namespace = ? AND cluster_id = ? AND algorithm = 'graphrag'",
                )
                .bind(label)
                .bind(summary)
                .bind(Utc::now().to_rfc3339())
                .bind(namespace)
                .bind(cluster_id)
                .execute(&self.pool)
                .await?;
                Ok(false)
            }
            Some(_) => Ok(false),
            None => {
                self.insert_summary(&ClusterSummary {
                    cluster_id: cluster_id.to_string(),
                    namespace: namespace.to_string(),
                    algorithm: "graphrag".to_string(),
                    top_terms_hash: String::new(),
                    label: label.to_string(),
                    summary: summary.to_string(),
                    token_count: 0,
                })
                .await?;
                Ok(true)
            }
        }
    }

    // ---------------------- snapshots ----------------------

    pub async fn insert_snapshot(&self, snapshot: &GraphSnapshot) -> GraphResult<()> {
        sqlx::query(
            "INSERT INTO graphrag_snapshots
             (id, namespace, node_count, edge_count, modularity, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.namespace)
        .bind(snapshot.node_count)
        .bind(snapshot.edge_count)
        .bind(snapshot.modularity)
        .bind(serde_json::to_string(&snapshot.metadata)?)
        .bind(snapshot.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_snapshots(&self, namespace: &str, limit: i64) -> GraphResult<Vec<GraphSnapshot>> {
        let rows = sqlx::query(
            "SELECT * FROM graphrag_snapshots WHERE namespace = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(namespace)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_snapshot).collect()
    }

    pub async fn get_snapshot(&self, id: &str) -> GraphResult<Option<GraphSnapshot>> {
        let row = sqlx::query("SELECT * FROM graphrag_snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_snapshot(&r)).transpose()
    }

    // ---------------------- ingest log ----------------------

    /// New docs land as `ingested`; a changed content hash flips the row to
    /// `stale` and records the previous hash in meta.
    pub async fn upsert_ingest_log(
        &self,
        doc_id: &str,
        namespace: &str,
        content_hash: &str,
        meta: Value,
    ) -> GraphResult<()> {
        let now = Utc::now().to_rfc3339();
        let existing = sqlx::query("SELECT content_hash, meta FROM graphrag_ingest_log WHERE id = ? AND namespace = ?")
            .bind(doc_id)
            .bind(namespace)
            .fetch_optional(&self.pool)
            .await?;
        match existing {
            Some(row) => {
                let old_hash: String = row.get("content_hash");
                if old_hash != content_hash {
                    let mut meta_obj: Map<String, Value> =
                        serde_json::from_str(&row.get::<String, _>("meta")).unwrap_or_default();
                    let prev = meta_obj
                        .entry("prev_hash".to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Some(arr) = prev.as_array_mut() {
                        arr.push(Value::String(old_hash));
                    }
                    sqlx::query(
                        "UPDATE graphrag_ingest_log
                         SET content_hash = ?, status = 'stale', last_ingest_at = ?, meta = ?
                         WHERE id = ? AND namespace = ?",
                    )
                    .bind(content_hash)
                    .bind(&now)
                    .bind(serde_json::to_string(&meta_obj)?)
                    .bind(doc_id)
                    .bind(namespace)
                    .execute(&self.pool)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE graphrag_ingest_log SET last_ingest_at = ? WHERE id = ? AND namespace = ?",
                    )
                    .bind(&now)
                    .bind(doc_id)
                    .bind(namespace)
                    .execute(&self.pool)
                    .await?;
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO graphrag_ingest_log
                     (id, namespace, content_hash, status, first_seen_at, last_ingest_at, meta)
                     VALUES (?, ?, ?, 'ingested', ?, ?, ?)",
                )
                .bind(doc_id)
                .bind(namespace)
                .bind(content_hash)
                .bind(&now)
                .bind(&now)
                .bind(serde_json::to_string(&meta)?)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn ingest_log(&self, namespace: &str) -> GraphResult<Vec<IngestLogEntry>> {
        let rows = sqlx::query("SELECT * FROM graphrag_ingest_log WHERE namespace = ? ORDER BY id")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log_entry).collect()
    }

    pub async fn mark_docs_indexed(&self, namespace: &str, doc_ids: &[String]) -> GraphResult<()> {
        if doc_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE graphrag_ingest_log SET status = 'indexed', last_indexed_at = ",
        );
        qb.push_bind(now.clone());
        qb.push(" WHERE namespace = ").push_bind(namespace);
        qb.push(" AND id IN (");
        let mut sep = qb.separated(", ");
        for id in doc_ids {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(")");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count_indexed_docs(&self, namespace: &str) -> GraphResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM graphrag_ingest_log WHERE namespace = ? AND status = 'indexed'",
        )
        .bind(namespace)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("c"))
    }
}

// ---------------------- row mapping & tx helpers ----------------------

type Tx<'a> = sqlx::Transaction<'a, Sqlite>;

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> GraphResult<GraphNode> {
    let properties: Map<String, Value> =
        serde_json::from_str(&row.get::<String, _>("properties")).unwrap_or_default();
    let source_ids: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("source_ids")).unwrap_or_default();
    let embedding: Vec<f32> =
        serde_json::from_str(&row.get::<String, _>("embedding")).unwrap_or_default();
    Ok(GraphNode {
        id: row.get("id"),
        label: row.get("label"),
        name: row.get("name"),
        properties,
        source_ids,
        embedding,
        namespace: row.get("namespace"),
    })
}

fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> GraphResult<GraphEdge> {
    let properties: Map<String, Value> =
        serde_json::from_str(&row.get::<String, _>("properties")).unwrap_or_default();
    Ok(GraphEdge {
        id: row.get("id"),
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        relation: row.get("relation"),
        confidence: row.get("confidence"),
        properties,
        namespace: row.get("namespace"),
    })
}

fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> GraphResult<GraphSnapshot> {
    Ok(GraphSnapshot {
        id: row.get("id"),
        namespace: row.get("namespace"),
        node_count: row.get("node_count"),
        edge_count: row.get("edge_count"),
        modularity: row.get("modularity"),
        metadata: serde_json::from_str(&row.get::<String, _>("metadata"))
            .unwrap_or(Value::Object(Map::new())),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
    })
}

fn row_to_log_entry(row: &sqlx::sqlite::SqliteRow) -> GraphResult<IngestLogEntry> {
    Ok(IngestLogEntry {
        doc_id: row.get("id"),
        namespace: row.get("namespace"),
        content_hash: row.get("content_hash"),
        status: IngestStatus::parse(&row.get::<String, _>("status")),
        first_seen_at: parse_ts(&row.get::<String, _>("first_seen_at")),
        last_ingest_at: parse_ts(&row.get::<String, _>("last_ingest_at")),
        last_indexed_at: row
            .get::<Option<String>, _>("last_indexed_at")
            .map(|s| parse_ts(&s)),
        meta: serde_json::from_str(&row.get::<String, _>("meta")).unwrap_or(Value::Object(Map::new())),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

async fn insert_node_tx(tx: &mut Tx<'_>, node: &GraphNode) -> GraphResult<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT OR REPLACE INTO graphrag_nodes
         (id, label, name, properties, source_ids, embedding, namespace, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&node.id)
    .bind(&node.label)
    .bind(&node.name)
    .bind(serde_json::to_string(&node.properties)?)
    .bind(serde_json::to_string(&node.source_ids)?)
    .bind(serde_json::to_string(&node.embedding)?)
    .bind(&node.namespace)
    .bind(&now)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_node_tx(tx: &mut Tx<'_>, node: &GraphNode) -> GraphResult<()> {
    sqlx::query(
        "UPDATE graphrag_nodes
         SET label = ?, name = ?, properties = ?, source_ids = ?, embedding = ?, namespace = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&node.label)
    .bind(&node.name)
    .bind(serde_json::to_string(&node.properties)?)
    .bind(serde_json::to_string(&node.source_ids)?)
    .bind(serde_json::to_string(&node.embedding)?)
    .bind(&node.namespace)
    .bind(Utc::now().to_rfc3339())
    .bind(&node.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_node_tx(tx: &mut Tx<'_>, node: &GraphNode) -> GraphResult<()> {
    let existing = sqlx::query("SELECT * FROM graphrag_nodes WHERE id = ? LIMIT 1")
        .bind(&node.id)
        .fetch_optional(&mut **tx)
        .await?;
    match existing {
        Some(row) => {
            let mut target = row_to_node(&row)?;
            merge_node(&mut target, node);
            update_node_tx(tx, &target).await
        }
        None => insert_node_tx(tx, node).await,
    }
}

async fn insert_edge_tx(tx: &mut Tx<'_>, edge: &GraphEdge) -> GraphResult<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT OR REPLACE INTO graphrag_edges
         (id, source_id, target_id, relation, confidence, properties, namespace, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&edge.id)
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .bind(&edge.relation)
    .bind(edge.confidence)
    .bind(serde_json::to_string(&edge.properties)?)
    .bind(&edge.namespace)
    .bind(&now)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn purge_doc_tx(tx: &mut Tx<'_>, doc_id: &str) -> GraphResult<()> {
    let chunk_prefix = format!("{}::chunk::%", doc_id);
    let section_prefix = format!("{}::section::%", doc_id);
    sqlx::query(
        "DELETE FROM graphrag_edges
         WHERE source_id LIKE ? OR target_id LIKE ? OR source_id LIKE ? OR target_id LIKE ?",
    )
    .bind(&chunk_prefix)
    .bind(&chunk_prefix)
    .bind(&section_prefix)
    .bind(&section_prefix)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM graphrag_nodes WHERE id LIKE ? OR id LIKE ?")
        .bind(&chunk_prefix)
        .bind(&section_prefix)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Shallow property merge (incoming wins, namespace kept), source_ids union,
/// embedding filled only when previously empty.
fn merge_node(target: &mut GraphNode, incoming: &GraphNode) {
    for (k, v) in &incoming.properties {
        if k == "namespace" {
            continue;
        }
        target.properties.insert(k.clone(), v.clone());
    }
    target
        .properties
        .insert("namespace".to_string(), Value::String(target.namespace.clone()));
    for sid in &incoming.source_ids {
        if !target.source_ids.contains(sid) {
            target.source_ids.push(sid.clone());
        }
    }
    if target.embedding.is_empty() && !incoming.embedding.is_empty() {
        target.embedding = incoming.embedding.clone();
    }
    if target.label == crate::models::label::ENTITY && incoming.label != crate::models::label::ENTITY
    {
        target.label = incoming.label.clone();
    }
}

fn resolve_endpoint(endpoint: &EndpointRef, canonical: &HashMap<String, String>) -> Option<String> {
    match endpoint {
        EndpointRef::Node(id) => Some(id.clone()),
        EndpointRef::Entity(name) => canonical.get(&name.to_lowercase()).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::label;

    #[tokio::test]
    async fn upsert_merges_properties_and_fills_embedding_once() {
        let store = SqlStore::in_memory().await.unwrap();
        let mut node = GraphNode::new("n1", label::ENTITY, "Rust", "public")
            .with_property("a", Value::from(1));
        store.upsert_nodes(&[node.clone()]).await.unwrap();

        node.embedding = vec![0.5, 0.5];
        node.properties.insert("b".to_string(), Value::from(2));
        store.upsert_nodes(&[node.clone()]).await.unwrap();

        node.embedding = vec![0.9, 0.9];
        store.upsert_nodes(&[node]).await.unwrap();

        let stored = store.get_node("n1").await.unwrap().unwrap();
        assert_eq!(stored.prop_f64("a"), Some(1.0));
        assert_eq!(stored.prop_f64("b"), Some(2.0));
        // First non-empty embedding wins.
        assert_eq!(stored.embedding, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn delete_doc_scoped_removes_chunks_and_touching_edges() {
        let store = SqlStore::in_memory().await.unwrap();
        let chunk = GraphNode::new("d1::chunk::0", label::CHUNK, "Chunk 0", "public");
        let entity = GraphNode::new("e1", label::ENTITY, "Alpha", "public");
        store.upsert_nodes(&[chunk, entity]).await.unwrap();
        let edge = GraphEdge::new("e1", "d1::chunk::0", crate::models::relation::MENTIONED_IN, 0.6, "public");
        store.upsert_edges(&[edge]).await.unwrap();

        store.delete_doc_scoped("d1").await.unwrap();

        assert!(store.get_node("d1::chunk::0").await.unwrap().is_none());
        assert!(store.get_node("e1").await.unwrap().is_some());
        let edges = store
            .scan_edges(&EdgeFilter::namespace("public"))
            .await
            .unwrap();
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn ingest_log_flips_to_stale_on_new_hash() {
        let store = SqlStore::in_memory().await.unwrap();
        store
            .upsert_ingest_log("doc", "public", "h1", Value::Object(Map::new()))
            .await
            .unwrap();
        store.mark_docs_indexed("public", &["doc".to_string()]).await.unwrap();
        let log = store.ingest_log("public").await.unwrap();
        assert_eq!(log[0].status, IngestStatus::Indexed);

        store
            .upsert_ingest_log("doc", "public", "h2", Value::Object(Map::new()))
            .await
            .unwrap();
        let log = store.ingest_log("public").await.unwrap();
        assert_eq!(log[0].status, IngestStatus::Stale);
        assert_eq!(log[0].content_hash, "h2");
    }
}
