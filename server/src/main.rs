//! All-in-one binary: wires the scrape manager, profile store, query
//! engine, gRPC store service and JSON API into one running process.
//! Grounded on the original's `runAll` command, which starts the same
//! set of components against one shared config and exits on the first
//! fatal error or a termination signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api::ApiState;
use pconfig::ConfigReloader;
use prometheus::Registry;
use query::{NoopSymbolizer, QueryEngine};
use scrape::{ScrapeManager, StoreAppender};
use store::RocksStore;
use tracing_subscriber::EnvFilter;

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .unwrap_or_else(|| "conprof.yml".to_string())
        .into()
}

fn env_addr(var: &str, default: &str) -> SocketAddr {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or_else(|_| default.parse().unwrap())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal error, exiting");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), common::error::Error> {
    let path = config_path();
    let (reloader, mut config_rx) = ConfigReloader::start(&path)?;
    let reloader = Arc::new(reloader);
    let initial = config_rx.borrow_and_update().clone();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(initial.global.log_level.clone())),
        )
        .init();

    tracing::info!(path = %path.display(), "loaded configuration");

    let registry = Registry::new();

    let store: Arc<dyn store::ProfileStore> = Arc::new(RocksStore::open(&initial.storage.data_dir)?);

    let appender = Arc::new(StoreAppender::new(store.clone(), &registry));
    let scrape_manager = Arc::new(ScrapeManager::new(appender, &registry));
    scrape_manager.clone().watch_config(config_rx.clone());

    let engine = Arc::new(
        QueryEngine::new(store.clone(), Arc::new(NoopSymbolizer))
            .with_max_merge_bytes(initial.global.max_merge_batch_size)
            .with_registry(&registry),
    );

    spawn_gc_loop(store.clone(), config_rx.clone());

    let http_addr = env_addr("CONPROF_HTTP_ADDR", "0.0.0.0:10902");
    let grpc_addr = env_addr("CONPROF_GRPC_ADDR", "0.0.0.0:10901");

    let api_state = ApiState {
        engine,
        scrape_manager,
        config: config_rx,
        reloader,
        registry,
        query_timeout: initial.global.query_timeout,
    };
    let app = api::router(api_state);

    let grpc_service = grpcstore::StoreService::new(store).into_server();

    tracing::info!(%http_addr, "starting JSON API");
    tracing::info!(%grpc_addr, "starting gRPC store service");

    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|e| common::error::Error::Internal(format!("binding http listener on {http_addr}: {e}")))?;

    let http_server = axum::serve(http_listener, app).with_graceful_shutdown(shutdown_signal());

    let grpc_server = tonic::transport::Server::builder()
        .add_service(grpc_service)
        .serve_with_shutdown(grpc_addr, shutdown_signal());

    let (http_result, grpc_result) = tokio::join!(http_server, grpc_server);
    http_result.map_err(|e| common::error::Error::Internal(format!("http server error: {e}")))?;
    grpc_result.map_err(|e| common::error::Error::Internal(format!("grpc server error: {e}")))?;

    Ok(())
}

/// Periodically drops profiles older than `storage.retention`, re-reading
/// the retention window from the latest config on every tick so a reload
/// takes effect without restarting the process.
fn spawn_gc_loop(store: Arc<dyn store::ProfileStore>, config_rx: tokio::sync::watch::Receiver<Arc<pconfig::Config>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let retention = config_rx.borrow().storage.retention;
            let now_ms = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
                Ok(d) => d.as_millis() as i64,
                Err(_) => continue,
            };
            match store.gc(now_ms, retention.as_millis() as i64) {
                Ok(deleted) if deleted > 0 => tracing::info!(deleted, "garbage collected expired profiles"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "garbage collection failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
