use std::sync::Arc;
use std::time::Duration;

use pconfig::ConfigReloader;
use prometheus::Registry;
use query::QueryEngine;
use scrape::ScrapeManager;
use tokio::sync::watch;

/// Shared handle every route closes over; mirrors the original's `API`
/// struct (db/registry/targets/config all held by the same value) but as
/// plain `Arc`s instead of a `sync.RWMutex`-guarded struct, since the
/// pieces that change (config, targets) already publish through their
/// own atomics.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<QueryEngine>,
    pub scrape_manager: Arc<ScrapeManager>,
    pub config: watch::Receiver<Arc<pconfig::Config>>,
    pub reloader: Arc<ConfigReloader>,
    pub registry: Registry,
    pub query_timeout: Duration,
}
