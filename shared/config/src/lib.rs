//! GraphRAG service configuration.
//!
//! All knobs come from the environment (a `.env` file is honored when
//! present). Values are read once at startup; the resulting `AppConfig` is
//! cloned into every component that needs it.

use std::env;
use std::path::PathBuf;

/// Which graph backend persists nodes and edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphStoreKind {
    /// Single-writer SQL store with JSON columns (default).
    Relational,
    /// Property-graph backend mirroring writes, with native shortest path.
    GraphNative,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Hard switch: when false every graph endpoint answers `disabled`.
    pub enable_graphrag: bool,
    pub graph_store: GraphStoreKind,

    // Graph-native backend (used only when graph_store = GraphNative)
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    /// External vector index; empty disables mirroring.
    pub vector_store_url: String,

    /// Embedding provider ("openai" or empty for none).
    pub embedding_provider: String,
    pub embedding_model: String,
    pub openai_api_key: String,

    pub default_namespace: String,

    /// 0 disables the periodic index scheduler.
    pub index_schedule_interval_seconds: u64,

    pub cluster_summary_daily_token_budget: u32,
    pub cluster_summary_max_tokens_per: u32,
    pub cluster_summary_rate_limit_per_min: u32,

    /// When set, guarded endpoints require a matching `x-api-key` header.
    pub graphrag_api_key: String,

    /// Root for orchestrator artifact runs, markers and the lock file.
    pub artifacts_dir: PathBuf,

    /// Directory scanned by the orchestrator's fallback pipeline.
    pub raw_docs_dir: PathBuf,

    pub database_url: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let graph_store = match var_or("GRAPH_STORE", "relational").as_str() {
            "graph-native" | "neo4j" => GraphStoreKind::GraphNative,
            other => {
                if other != "relational" {
                    tracing::warn!("Unknown GRAPH_STORE '{}', using relational", other);
                }
                GraphStoreKind::Relational
            }
        };

        Self {
            enable_graphrag: var_or("ENABLE_GRAPHRAG", "true").to_lowercase() == "true",
            graph_store,
            neo4j_uri: var_or("NEO4J_URI", ""),
            neo4j_user: var_or("NEO4J_USER", ""),
            neo4j_password: var_or("NEO4J_PASSWORD", ""),
            vector_store_url: var_or("VECTOR_STORE_URL", ""),
            embedding_provider: var_or("EMBEDDING_PROVIDER", "openai"),
            embedding_model: var_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            openai_api_key: var_or("OPENAI_API_KEY", ""),
            default_namespace: var_or("DEFAULT_NAMESPACE", "public"),
            index_schedule_interval_seconds: parse_or("INDEX_SCHEDULE_INTERVAL_SECONDS", 0),
            cluster_summary_daily_token_budget: parse_or("CLUSTER_SUMMARY_DAILY_TOKEN_BUDGET", 20_000),
            cluster_summary_max_tokens_per: parse_or("CLUSTER_SUMMARY_MAX_TOKENS_PER", 180),
            cluster_summary_rate_limit_per_min: parse_or("CLUSTER_SUMMARY_RATE_LIMIT_PER_MIN", 15),
            graphrag_api_key: var_or("GRAPHRAG_API_KEY", ""),
            artifacts_dir: PathBuf::from(var_or("ARTIFACTS_DIR", "./artifacts")),
            raw_docs_dir: PathBuf::from(var_or("RAW_DOCS_DIR", "./data/raw_docs")),
            database_url: var_or("DATABASE_URL", "sqlite::memory:"),
            port: parse_or("GRAPH_PORT", 8006),
        }
    }

    /// True when embeddings are configured end to end.
    pub fn embeddings_enabled(&self) -> bool {
        !self.embedding_provider.is_empty()
            && !self.embedding_model.is_empty()
            && !self.openai_api_key.is_empty()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enable_graphrag: true,
            graph_store: GraphStoreKind::Relational,
            neo4j_uri: String::new(),
            neo4j_user: String::new(),
            neo4j_password: String::new(),
            vector_store_url: String::new(),
            embedding_provider: String::new(),
            embedding_model: String::new(),
            openai_api_key: String::new(),
            default_namespace: "public".to_string(),
            index_schedule_interval_seconds: 0,
            cluster_summary_daily_token_budget: 20_000,
            cluster_summary_max_tokens_per: 180,
            cluster_summary_rate_limit_per_min: 15,
            graphrag_api_key: String::new(),
            artifacts_dir: PathBuf::from("./artifacts"),
            raw_docs_dir: PathBuf::from("./data/raw_docs"),
            database_url: "sqlite::memory:".to_string(),
            port: 8006,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_relational_and_enabled() {
        let cfg = AppConfig::default();
        assert!(cfg.enable_graphrag);
        assert_eq!(cfg.graph_store, GraphStoreKind::Relational);
        assert_eq!(cfg.default_namespace, "public");
        assert!(!cfg.embeddings_enabled());
    }
}
