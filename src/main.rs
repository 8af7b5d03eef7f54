//! quotewire - market-data serving backend.
//!
//! Boot order: config, tracing, store, caches, adapter registry, fetch
//! coordinator, warm-up scheduler, websocket state, HTTP router. Every
//! long-lived component is constructed once here and injected; nothing is
//! an ambient singleton.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotewire_backend::adapters::{upstream_http_client, AdapterRegistry};
use quotewire_backend::api::{self, ApiState};
use quotewire_backend::cache::CacheService;
use quotewire_backend::config::Config;
use quotewire_backend::fetcher::DataFetcher;
use quotewire_backend::store::Store;
use quotewire_backend::warmup::industry::EastmoneyIndustrySource;
use quotewire_backend::warmup::{WarmupConfig, WarmupScheduler};
use quotewire_backend::ws::{ConnectionManager, StreamService};

#[derive(Debug, Parser)]
#[command(name = "quotewire", about = "Market-data serving backend")]
struct Args {
    /// Listen port; overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,

    /// Sqlite store path; overrides STORE_URL.
    #[arg(long)]
    db: Option<String>,

    /// Skip the warm-up scheduler (useful for local development).
    #[arg(long, env = "NO_WARMUP")]
    no_warmup: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotewire_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = args.db {
        config.store_path = db;
    }

    init_tracing();
    info!("🚀 quotewire market-data backend starting");

    let store = Arc::new(Store::open(&config.store_path).context("store init failed")?);
    info!("📊 store ready at {}", config.store_path);

    let cache = Arc::new(CacheService::from_config(&config));
    cache.start().await;

    let adapters = Arc::new(AdapterRegistry::with_defaults(config.upstream_timeout));
    let fetcher = Arc::new(DataFetcher::new(store, cache, adapters));

    if args.no_warmup {
        info!("warm-up scheduler disabled");
    } else {
        let warmup_config = WarmupConfig {
            hot_limit: config.warmup_hot_limit,
            interval: config.warmup_interval,
            industry_min_reseed: config.warmup_industry_min_reseed,
            ..Default::default()
        };
        let industry_source = Arc::new(EastmoneyIndustrySource::new(
            upstream_http_client(config.upstream_timeout),
            50,
        ));
        let scheduler = Arc::new(
            WarmupScheduler::new(fetcher.clone(), warmup_config)
                .with_industry_source(industry_source),
        );
        scheduler.spawn();
        info!("warm-up scheduler started");
    }

    let connections = Arc::new(ConnectionManager::new(
        config.ws_heartbeat_interval,
        config.ws_idle_timeout,
        config.ws_send_timeout,
    ));
    connections.spawn_janitor(Duration::from_secs(60));

    let streams = Arc::new(StreamService::new(connections.clone(), fetcher.clone()));

    let app = api::router(ApiState {
        fetcher,
        connections,
        streams: streams.clone(),
    })
    .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            streams.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
