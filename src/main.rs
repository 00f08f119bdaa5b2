use std::sync::Arc;

use learnloop::{
    server, AdaptiveEngine, EngineConfig, EventPublisher, EventStore, MessageBroker, Orchestrator,
    ServiceRegistry,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::load().map_err(|e| anyhow::anyhow!(e))?;

    let store = match &config.journal_dir {
        Some(dir) => Arc::new(EventStore::open(dir)?),
        None => Arc::new(EventStore::new()),
    };
    let publisher = Arc::new(EventPublisher::new(store));

    let broker = Arc::new(MessageBroker::new());
    broker.start();
    let registry = Arc::new(ServiceRegistry::new(config.staleness_threshold()));
    let orchestrator = Orchestrator::connect(
        broker.clone(),
        registry,
        config.reply_channel.clone(),
        config.workflow_timeout(),
    )
    .await;

    let engine = Arc::new(AdaptiveEngine::new(
        publisher,
        orchestrator,
        config.mastery_threshold,
    ));
    let app = server::router(engine);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "learnloop server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
