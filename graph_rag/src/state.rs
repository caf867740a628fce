//! Application state: every component wired once at startup and shared
//! through `web::Data`.

use std::sync::Arc;
use tracing::{info, warn};

use graphrag_config::{AppConfig, GraphStoreKind};

use crate::ai::{EmbeddingService, LlmClient};
use crate::events::EventBus;
use crate::metrics::MetricsRegistry;
use crate::orchestrator::IndexOrchestrator;
use crate::services::answer::Answerer;
use crate::services::cluster::ClusterService;
use crate::services::extraction::Extractor;
use crate::services::ingest::Ingestor;
use crate::services::layout::LayoutService;
use crate::services::pathfind::Pathfinder;
use crate::services::query_adapter::QueryAdapter;
use crate::services::retrieval::Retriever;
use crate::services::snapshot::SnapshotService;
use crate::services::vector_store::VectorStoreService;
use crate::store::{GraphStore, Neo4jMirror, SqlStore};

pub struct AppState {
    pub config: AppConfig,
    pub store: GraphStore,
    pub ingestor: Ingestor,
    pub retriever: Arc<Retriever>,
    pub query_adapter: QueryAdapter,
    pub answerer: Answerer,
    pub pathfinder: Pathfinder,
    pub clusters: Arc<ClusterService>,
    pub snapshots: SnapshotService,
    pub layout: LayoutService,
    pub orchestrator: Arc<IndexOrchestrator>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    pub async fn build(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let sql = SqlStore::connect(&config.database_url).await?;
        let store = match config.graph_store {
            GraphStoreKind::GraphNative if !config.neo4j_uri.is_empty() => {
                match Neo4jMirror::new(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
                    .await
                {
                    Ok(mirror) => GraphStore::graph_native(sql.clone(), Arc::new(mirror)),
                    Err(e) => {
                        warn!("graph-native backend unavailable, using relational: {}", e);
                        GraphStore::relational(sql.clone())
                    }
                }
            }
            GraphStoreKind::GraphNative => {
                warn!("GRAPH_STORE=graph-native but NEO4J_URI is empty, using relational");
                GraphStore::relational(sql.clone())
            }
            GraphStoreKind::Relational => GraphStore::relational(sql.clone()),
        };

        let llm = LlmClient::from_config(&config);
        if llm.is_none() {
            info!("no LLM credentials configured, heuristic extraction only");
        }
        let embedder = Arc::new(EmbeddingService::new(llm.clone(), config.embeddings_enabled()));

        let vector_store = if config.vector_store_url.is_empty() {
            None
        } else {
            match VectorStoreService::new(&config.vector_store_url) {
                Ok(vs) => Some(Arc::new(vs)),
                Err(e) => {
                    warn!("vector store init failed, continuing without it: {}", e);
                    None
                }
            }
        };

        let metrics = Arc::new(MetricsRegistry::new());
        let events = Arc::new(EventBus::new());
        let layout = LayoutService::new(sql.clone());

        let retriever = Arc::new(Retriever::new(
            sql.clone(),
            embedder.clone(),
            vector_store.clone(),
            metrics.clone(),
        ));
        let query_adapter = QueryAdapter::new(
            sql.clone(),
            retriever.clone(),
            embedder.clone(),
            metrics.clone(),
            config.artifacts_dir.clone(),
        );
        let answerer = Answerer::new(retriever.clone(), llm.clone(), metrics.clone());
        let pathfinder = Pathfinder::new(store.clone());
        let clusters = Arc::new(ClusterService::new(
            sql.clone(),
            llm.clone(),
            config.cluster_summary_daily_token_budget,
            config.cluster_summary_max_tokens_per,
            config.cluster_summary_rate_limit_per_min,
        ));
        let snapshots = SnapshotService::new(sql.clone(), clusters.clone(), metrics.clone());
        let ingestor = Ingestor::new(
            store.clone(),
            Extractor::new(llm.clone()),
            embedder.clone(),
            vector_store.clone(),
            layout.clone(),
            events.clone(),
            metrics.clone(),
            config.default_namespace.clone(),
        );
        let orchestrator = Arc::new(IndexOrchestrator::new(
            sql,
            Arc::new(Extractor::new(llm)),
            metrics.clone(),
            config.artifacts_dir.clone(),
            config.raw_docs_dir.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            ingestor,
            retriever,
            query_adapter,
            answerer,
            pathfinder,
            clusters,
            snapshots,
            layout,
            orchestrator,
            events,
            metrics,
        }))
    }

    pub fn namespace_or_default(&self, namespace: Option<&str>) -> String {
        namespace
            .filter(|n| !n.trim().is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.config.default_namespace.clone())
    }
}
