use actix_web::{web, App, HttpServer};
use anyhow::Context;
use idempotent_consumer::{IdempotencyGuard, InMemoryProcessedEventStore, ProcessedEventStore};
use prometheus::Registry;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transactional_outbox::metrics::OutboxMetrics;
use transactional_outbox::{OutboxProcessor, OutboxRepository, SqlxOutboxRepository};

use video_catalog_service::clock::{Clock, SystemClock};
use video_catalog_service::config::StorageBackend;
use video_catalog_service::consumers::{
    run_dedup_cleanup, ChannelPublisher, ProjectionApplier, ProjectionConsumer,
};
use video_catalog_service::db::{
    CatalogStore, MemoryCatalog, MemoryProjectionStore, PgCatalogStore, PgProjectionStore,
    ProjectionStore,
};
use video_catalog_service::http::{self, HealthState, ReadinessProbe};
use video_catalog_service::metrics::{MetricsReporter, PrometheusReporter};
use video_catalog_service::Config;

const SERVICE_NAME: &str = "video-catalog-service";

/// Storage handles for one backend.
struct Backends<C, R, P, S: ProcessedEventStore> {
    catalog: Arc<C>,
    outbox: Arc<R>,
    projection: Arc<P>,
    dedup: IdempotencyGuard<S>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    info!(env = %config.app.env, storage = ?config.storage, "Configuration loaded");

    let registry = Registry::new();
    let reporter: Arc<dyn MetricsReporter> = Arc::new(PrometheusReporter::new(&registry)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match config.storage {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all state is lost on exit");
            let catalog = Arc::new(MemoryCatalog::new());
            let backends = Backends {
                outbox: Arc::clone(&catalog),
                catalog,
                projection: Arc::new(MemoryProjectionStore::new()),
                dedup: IdempotencyGuard::new(
                    InMemoryProcessedEventStore::new(),
                    config.dedup_retention(),
                ),
            };
            serve(config, registry, reporter, clock, backends).await
        }
        StorageBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
                .connect(&config.database.url)
                .await
                .context("Failed to connect to PostgreSQL")?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;
            info!("Database migrations applied");

            let backends = Backends {
                catalog: Arc::new(PgCatalogStore::new(pool.clone())),
                outbox: Arc::new(SqlxOutboxRepository::new(pool.clone())),
                projection: Arc::new(PgProjectionStore::new(pool.clone())),
                dedup: IdempotencyGuard::postgres(pool, config.dedup_retention()),
            };
            serve(config, registry, reporter, clock, backends).await
        }
    }
}

/// Run the outbox processor, projection consumer, dedup cleanup and the
/// operational HTTP server until a shutdown signal arrives.
async fn serve<C, R, P, S>(
    config: Config,
    registry: Registry,
    reporter: Arc<dyn MetricsReporter>,
    clock: Arc<dyn Clock>,
    backends: Backends<C, R, P, S>,
) -> anyhow::Result<()>
where
    C: CatalogStore,
    R: OutboxRepository + 'static,
    P: ProjectionStore,
    S: ProcessedEventStore + 'static,
{
    let Backends {
        catalog,
        outbox,
        projection,
        dedup,
    } = backends;
    let dedup = dedup.with_lease(config.dedup_lease());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (publisher, deliveries) = ChannelPublisher::channel(config.consumer.channel_capacity);
    let processor = OutboxProcessor::new(outbox, Arc::new(publisher), config.outbox_processor())
        .with_metrics(OutboxMetrics::new(SERVICE_NAME, &registry)?);
    let processor_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = processor.run(shutdown).await {
                error!(error = %e, "Outbox processor stopped with error");
            }
        })
    };

    let applier = ProjectionApplier::new(
        Arc::clone(&projection),
        Arc::clone(&clock),
        Arc::clone(&reporter),
    );
    let consumer = Arc::new(ProjectionConsumer::new(
        dedup.clone(),
        applier,
        clock,
        reporter,
        config.consumer_config(),
    ));
    let consumer_task = tokio::spawn(consumer.run(deliveries, shutdown_rx.clone()));
    let cleanup_task = tokio::spawn(run_dedup_cleanup(
        dedup,
        config.cleanup_interval(),
        shutdown_rx,
    ));

    let health = web::Data::new(HealthState::new(
        vec![
            ReadinessProbe::catalog(catalog),
            ReadinessProbe::projection(projection),
        ],
        registry,
    ));
    let bind_addr = (config.app.host.clone(), config.app.port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(health.clone())
            .configure(http::configure)
    })
    .bind(bind_addr.clone())
    .with_context(|| format!("Failed to bind {}:{}", bind_addr.0, bind_addr.1))?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    info!(host = %bind_addr.0, port = bind_addr.1, "HTTP server listening");

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            server_handle.stop(true).await;
        }
    }

    let _ = shutdown_tx.send(true);
    for (name, task) in [
        ("outbox processor", processor_task),
        ("projection consumer", consumer_task),
        ("dedup cleanup", cleanup_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
