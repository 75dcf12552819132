mod config;
mod server;

use clap::Parser;
use config::Settings;
use permaseed_core::aggregator::{Bundler, BundlerConfig};
use permaseed_core::cache::{self, NetCache};
use permaseed_core::fee::FeeOracle;
use permaseed_core::gateway::{Gateway, PayClient};
use permaseed_core::store::Store;
use permaseed_core::taskmgr::{TaskManager, DEFAULT_WORKERS};
use permaseed_core::wdb::Wdb;
use permaseed_core::{RawDbBuilder, Result, Wallet};
use server::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_REFRESH_SECS: u64 = 60;
const PRICE_REFRESH_SECS: u64 = 300;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "permaseed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::parse();
    if let Err(e) = run(settings).await {
        tracing::error!("startup failed: {e}");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<()> {
    let custom_tags = settings.custom_tags()?;

    let raw_db = RawDbBuilder::new()
        .backend(&settings.store_backend)
        .dir(&settings.db_dir)
        .bucket_prefix(&settings.store_prefix)
        .region(&settings.s3_region)
        .endpoint(settings.s3_endpoint.clone())
        .credentials(&settings.s3_acc_key, &settings.s3_secret_key)
        .build()
        .await?;
    let store = Arc::new(Store::new(raw_db));
    tracing::info!("blob store ready ({})", settings.store_backend);

    let wdb = Arc::new(Wdb::open(&settings.sqlite_dir)?);
    wdb.migrate(settings.no_fee, settings.manifest)?;
    tracing::info!("relational store ready at {}", settings.sqlite_dir.display());

    let wallet = Arc::new(Wallet::from_jwk_file(&settings.key_path)?);
    tracing::info!("bundler wallet {}", wallet.address);

    let gateway = Arc::new(Gateway::new(&settings.ar_node, HTTP_TIMEOUT)?);
    let pay = PayClient::new(&settings.pay_url, HTTP_TIMEOUT)?;
    let net_cache = Arc::new(NetCache::new());
    if let Err(e) = cache::refresh_once(&net_cache, &gateway).await {
        tracing::warn!("initial network refresh failed, serving stale-empty caches: {e}");
    }

    let tasks = TaskManager::new(store.clone(), net_cache.clone(), gateway.clone());
    // the pending pool must be back in the queue before we accept requests
    tasks.recover().await?;
    tasks.spawn_workers(DEFAULT_WORKERS);

    let fee = Arc::new(FeeOracle::new(
        wdb.clone(),
        net_cache.clone(),
        settings.serve_fee,
        settings.no_fee,
    ));
    if !settings.no_fee {
        if let Err(e) = fee.refresh_prices(&pay).await {
            tracing::warn!("initial token price refresh failed: {e}");
        }
    }

    let bundler = Bundler::new(
        store.clone(),
        wdb.clone(),
        net_cache.clone(),
        fee.clone(),
        wallet,
        tasks.clone(),
        gateway.clone(),
        pay.clone(),
        BundlerConfig {
            no_fee: settings.no_fee,
            enable_manifest: settings.manifest,
            custom_tags,
            ..Default::default()
        },
    );

    tokio::spawn(cache::run_refresher(
        net_cache.clone(),
        gateway.clone(),
        CACHE_REFRESH_SECS,
    ));
    if !settings.no_fee {
        tokio::spawn(fee.clone().run_refresher(pay, PRICE_REFRESH_SECS));
    }
    bundler.spawn_loops(settings.bundle_interval);

    let state = Arc::new(AppState {
        store,
        wdb,
        cache: net_cache,
        tasks,
        bundler,
        fee,
        proxy_client: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| permaseed_core::SeedError::Http(e.to_string()))?,
        upstream: settings.ar_node.trim_end_matches('/').to_string(),
    });

    let listener = tokio::net::TcpListener::bind(&settings.listen).await?;
    tracing::info!("listening on {}", settings.listen);
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining for shutdown");
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
