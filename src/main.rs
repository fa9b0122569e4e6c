// =============================================================================
// POPULARITY ENGINE DAEMON
// =============================================================================
//
// Runs the scheduled half of the engine: the like reconciler and the stats
// endpoint. The request-path operations are called in-process by the API
// servers, which link the library and share the same Redis and database.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use popularity_engine::cache::keys::KeySpace;
use popularity_engine::cache::{CounterCache, RedisCounterCache};
use popularity_engine::store::{MemorySubjectStore, PgSubjectStore, SubjectStore};
use popularity_engine::{metrics, Config, PopularityEngine};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SubjectStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgSubjectStore::connect(url, config.db_max_connections)
                .await
                .context("connecting to the subject store")?;
            store.ensure_schema().await.context("ensuring the subject schema")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("POPULARITY_DATABASE_URL unset, using an in-memory subject store");
            Ok(Arc::new(MemorySubjectStore::new()))
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(config.log_json);

    info!(
        redis_url = %config.redis_url,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        dedup_window_secs = config.dedup_window.as_secs(),
        click_dedup_window_secs = config.click_dedup_window.as_secs(),
        "Popularity engine starting"
    );

    let cache = RedisCounterCache::connect(
        &config.redis_url,
        KeySpace::new(config.key_prefix.clone()),
        config.scan_batch,
    )
    .await
    .context("connecting to the counter cache")?;
    cache.ping().await.context("pinging the counter cache")?;
    let cache: Arc<dyn CounterCache> = Arc::new(cache);

    let store = open_store(&config).await?;
    let engine = Arc::new(PopularityEngine::new(&config, cache, store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_handle = tokio::spawn(engine.reconciler().run(shutdown_rx.clone()));

    let stats_engine = engine.clone();
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_port = config.metrics_port;
    let metrics_handle = tokio::spawn(async move {
        metrics::run_metrics_server(
            metrics_port,
            move || serde_json::to_value(stats_engine.stats()).unwrap_or_default(),
            &mut metrics_shutdown,
        )
        .await;
    });

    info!(metrics_port, "Popularity engine running, Ctrl+C to stop");

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Signal listener error");
    }
    warn!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let joined = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = tokio::join!(reconciler_handle, metrics_handle);
    })
    .await;
    if joined.is_err() {
        warn!("Tasks did not stop within 10s, exiting anyway");
    }

    info!("Popularity engine stopped");
    Ok(())
}
