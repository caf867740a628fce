use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing::info;

use graph_rag::handlers;
use graph_rag::orchestrator::spawn_scheduler;
use graph_rag::state::AppState;
use graphrag_config::AppConfig;
use graphrag_observability::init_tracing_for;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_tracing_for("graph_rag");
    let config = AppConfig::from_env();
    let port = config.port;

    let state = AppState::build(config)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    if state.config.index_schedule_interval_seconds > 0 {
        spawn_scheduler(
            state.orchestrator.clone(),
            state.config.default_namespace.clone(),
            state.config.index_schedule_interval_seconds,
        );
        info!(
            interval = state.config.index_schedule_interval_seconds,
            "index scheduler enabled"
        );
    }

    info!(port, store = state.store.backend_name(), "starting GraphRAG service");
    let data = web::Data::new(state);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .configure(handlers::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
