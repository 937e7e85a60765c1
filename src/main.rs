//! eventline - Event-Sourced Persistence and Messaging Worker
//!
//! Hosts the processing topology: command processor, event dispatcher,
//! transactional event store and the rebuild operations. Handler
//! registration belongs to the embedding domain crates; this binary wires
//! the core and waits for shutdown.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eventline::bus::InMemoryBus;
use eventline::dispatcher::{DispatchMode, EventDispatcher};
use eventline::message_log::MessageLog;
use eventline::processor::CommandProcessor;
use eventline::rebuild::EventStoreRebuilder;
use eventline::serializer::JsonSerializer;
use eventline::tracer::{BoundedTracer, MessageTracer};
use eventline::worker::Worker;
use eventline::{db, Config};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting eventline worker");
    tracing::info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    let message_log_pool = if config.message_log_url == config.database_url {
        pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.message_log_url)
            .await?
    };
    let audit_pool = if config.rebuild_audit_url == config.database_url {
        pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.rebuild_audit_url)
            .await?
    };

    tracing::info!("Database connected successfully");

    // Core topology. Domain handlers register here when the worker is
    // embedded; the bare binary runs with empty registries.
    let tracer = Arc::new(BoundedTracer::new());
    let bus = Arc::new(InMemoryBus::new());
    let processor = Arc::new(
        CommandProcessor::new().with_tracer(Arc::clone(&tracer) as Arc<dyn MessageTracer>),
    );
    let dispatcher = Arc::new(
        EventDispatcher::new(DispatchMode::Concurrent)
            .with_tracer(tracer as Arc<dyn MessageTracer>),
    );
    let source = MessageLog::new(message_log_pool, Arc::new(JsonSerializer));
    let rebuilder = EventStoreRebuilder::new(
        source.clone(),
        pool.clone(),
        audit_pool,
        |_store, _processor, _dispatcher| {},
    );

    let worker = Worker::new(processor, dispatcher, bus, rebuilder, source);
    worker.start();
    tracing::info!(state = %worker.status(), "Worker ready");

    shutdown_signal().await;

    worker.stop();
    tracing::info!("Worker shutting down...");
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
