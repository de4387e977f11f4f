//! threadlink server
//!
//! Relays Unthread ticket events into the Telegram conversations they
//! belong to.

mod config;
mod server;
mod shutdown;
mod state;
mod telegram;
mod unthread;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use server::{build_router, run_server};
use shutdown::spawn_config_reload_handler;
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use telegram::TelegramDelivery;
use threadlink_core::config::ConfigStore;
use threadlink_core::entities::Repositories;
use threadlink_core::events::{EventQueue, InMemoryEventQueue, RedisEventQueue};
use threadlink_core::processors::{ConversationRouter, EventDispatcher, EventQueueConsumer, TicketService};
use threadlink_core::storage::{CacheTier, MemoryTier, PostgresTier, RedisTier, StorageReconciler, UnifiedStorage};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use unthread::UnthreadTicketing;

/// threadlink - Telegram and Unthread ticket bridge
#[derive(Parser, Debug)]
#[command(name = "threadlink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./threadlink.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "THREADLINK_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    init_tracing(args.log_json);

    tracing::info!("Starting threadlink v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    // Storage tiers. Redis is optional; without it the process runs on
    // memory and Postgres alone. The Redis connection is dialed lazily, so
    // an outage at startup only degrades the tier until it comes back.
    let memory = MemoryTier::new();
    let distributed: Option<Arc<dyn CacheTier>> = match &loaded_config.redis_url {
        Some(url) => {
            let tier = RedisTier::open(url).map_err(|e| {
                tracing::error!("Invalid redis_url: {}", e);
                e
            })?;
            if let Err(e) = tier.ping().await {
                tracing::warn!("Distributed tier unreachable, degrading until it recovers: {}", e);
            } else {
                tracing::info!("Distributed tier connected");
            }
            Some(Arc::new(tier))
        }
        None => {
            tracing::info!("No redis_url configured, distributed tier disabled");
            None
        }
    };
    let storage = UnifiedStorage::new(
        Arc::new(memory.clone()),
        distributed,
        Arc::new(PostgresTier::new(db_pool.clone())),
        &loaded_config.storage,
    );
    let restored = storage.restore_pending_deletes().await;
    if restored > 0 {
        let remaining = storage.reconcile().await;
        tracing::info!(restored, remaining, "Pending deletes carried over from the previous run");
    }
    let repositories = Repositories::new(storage.clone(), &loaded_config.sessions);

    // Event queue. The consumer keeps polling through Redis outages.
    let queue: Arc<dyn EventQueue> = match &loaded_config.redis_url {
        Some(url) => {
            let queue = RedisEventQueue::open(url, &loaded_config.queue.name).map_err(|e| {
                tracing::error!("Failed to set up the event queue: {}", e);
                e
            })?;
            tracing::info!(queue = queue.name(), "Event queue configured");
            Arc::new(queue)
        }
        None => {
            tracing::warn!("No redis_url configured, using a process-local event queue");
            Arc::new(InMemoryEventQueue::new())
        }
    };

    // Adapters
    let chat = Arc::new(TelegramDelivery::new(
        &loaded_config.telegram,
        loaded_config.router.delivery_timeout,
    )?);
    let ticketing = Arc::new(UnthreadTicketing::new(
        &loaded_config.unthread,
        loaded_config.consumer.handler_timeout,
    )?);

    // Event routing
    let mut dispatcher = EventDispatcher::new();
    Arc::new(ConversationRouter::new(
        &repositories,
        chat.clone(),
        loaded_config.router.clone(),
    ))
    .register(&mut dispatcher)?;
    let dispatcher = Arc::new(dispatcher);

    // Shared shutdown signal for background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_settings = ConfigStore::new(loaded_config.consumer.clone());

    let consumer = EventQueueConsumer::new(queue.clone(), dispatcher);
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx.clone(), consumer_settings.subscribe()));

    let reconciler = StorageReconciler::new(storage.clone(), loaded_config.storage.reconcile_interval);
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let sweeper_handle = tokio::spawn(memory.run_sweeper(loaded_config.storage.sweep_interval, shutdown_rx));

    // Spawn config reload handler (listens for SIGHUP)
    let reload_notify = spawn_config_reload_handler(config_loader, consumer_settings);

    // Create application state
    let tickets = Arc::new(TicketService::new(&repositories, ticketing, chat));
    let state = AppState::new(storage, queue, tickets);

    // Build the router
    let router = build_router(state);

    // Run the server
    let listen_addr = loaded_config.server.listen;
    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr).await;

    // Stop background workers; the consumer finishes its current batch first
    reload_notify.notify_one();
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Background workers already stopped");
    }
    for (name, handle) in [
        ("consumer", consumer_handle),
        ("reconciler", reconciler_handle),
        ("sweeper", sweeper_handle),
    ] {
        if let Err(e) = handle.await {
            tracing::error!("{} task failed: {}", name, e);
        }
    }

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
