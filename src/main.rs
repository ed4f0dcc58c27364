use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use watchwise::{
    api::{create_router, AppState},
    config::Config,
    db::{create_redis_client, KeyValueStore, MemoryStore, RedisStore},
    services::{
        generation::{MemoryCredentialStore, OpenAiCompatibleGenerator},
        providers::{
            ConnectorPool, JellyfinHistory, MediaConnectors, MediaLibrary, ServarrConnector,
            WatchHistorySource,
        },
        BackgroundScheduler, Collaborators, KvFeedbackLearner, NetworkMonitor, ProviderKeyPool,
        ProviderLimiter, RecommendationOrchestrator, RequestThrottle, SharedSettings,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("watchwise=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => {
            let client = create_redis_client(url).context("Invalid REDIS_URL")?;
            let store = RedisStore::connect(client)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Using Redis for durable state");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set, cache will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let keys = config.ai_keys();
    if keys.is_empty() {
        tracing::warn!(provider = %config.ai_provider, "No AI_API_KEYS configured, generation will fail");
    }
    let credentials = Arc::new(MemoryCredentialStore::with_keys(&config.ai_provider, &keys));
    let key_pool = Arc::new(ProviderKeyPool::new(credentials));
    key_pool.register(&config.ai_provider).await;

    let monitor = Arc::new(NetworkMonitor::default());
    let probe = monitor.spawn_probe(
        config.reachability_url.clone(),
        Duration::from_secs(config.reachability_interval_secs),
    );

    let settings = Arc::new(SharedSettings::new(config.settings()));
    let (retry_tx, retry_rx) = mpsc::unbounded_channel();

    let orchestrator = Arc::new(
        RecommendationOrchestrator::new(
            Collaborators {
                store: store.clone(),
                generator: Arc::new(OpenAiCompatibleGenerator::new(&config.ai_base_url)),
                key_pool,
                learner: Arc::new(KvFeedbackLearner::new(store)),
                connectors: media_connectors(&config),
                reachability: monitor,
                settings,
                throttle: Arc::new(RequestThrottle::new(config.throttle())),
                provider_limiter: Arc::new(ProviderLimiter::new(config.provider_limits())),
            },
            config.orchestrator(),
        )
        .with_retry_sender(retry_tx),
    );

    let scheduler =
        BackgroundScheduler::new(orchestrator.clone(), config.scheduler()).start(retry_rx);

    let app = create_router(AppState::new(orchestrator));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    probe.abort();
    Ok(())
}

fn media_connectors(config: &Config) -> MediaConnectors {
    let timeout = config.source_timeout();

    let series: Vec<Arc<dyn MediaLibrary>> = config
        .sonarr_instances()
        .into_iter()
        .enumerate()
        .map(|(i, (url, key))| {
            Arc::new(ServarrConnector::sonarr(format!("sonarr-{}", i + 1), url, key))
                as Arc<dyn MediaLibrary>
        })
        .collect();

    let movies: Vec<Arc<dyn MediaLibrary>> = config
        .radarr_instances()
        .into_iter()
        .enumerate()
        .map(|(i, (url, key))| {
            Arc::new(ServarrConnector::radarr(format!("radarr-{}", i + 1), url, key))
                as Arc<dyn MediaLibrary>
        })
        .collect();

    let history: Vec<Arc<dyn WatchHistorySource>> =
        match (&config.jellyfin_url, &config.jellyfin_api_key) {
            (Some(url), Some(key)) => {
                vec![Arc::new(JellyfinHistory::new("jellyfin", url, key)) as Arc<dyn WatchHistorySource>]
            }
            _ => Vec::new(),
        };

    tracing::info!(
        sonarr = series.len(),
        radarr = movies.len(),
        jellyfin = history.len(),
        "Configured media connectors"
    );

    MediaConnectors {
        series: ConnectorPool::new("sonarr", series, timeout),
        movies: ConnectorPool::new("radarr", movies, timeout),
        history: ConnectorPool::new("jellyfin", history, timeout),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}
