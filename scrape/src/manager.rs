//! Top-level scrape component: owns one `ScrapePool` per configured job
//! and reconciles them against a reloaded `pconfig::Config`. Grounded on
//! the teacher's `scrape::manager::Manager`, with the reload wiring
//! replaced by a `tokio::sync::watch` receiver instead of a raw mpsc
//! `Receiver<HashMap<...>>` loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::labels::Labels;
use pconfig::config::Config;
use prometheus::{IntCounterVec, Registry};
use tokio::sync::watch;

use crate::appender::Appender;
use crate::discovery::{discover_static, relabel};
use crate::pool::ScrapePool;
use crate::target::{populate_labels, url_from_labels, Target};

#[derive(Debug, Clone)]
pub struct TargetSnapshot {
    pub labels: BTreeMap<String, String>,
    pub discovered_labels: BTreeMap<String, String>,
    pub url: String,
    pub health: crate::target::TargetHealth,
    pub last_error: Option<String>,
    pub last_scrape_duration: Duration,
    pub skipped_scrapes: u64,
}

pub struct ScrapeManager {
    appender: Arc<dyn Appender>,
    pools: Mutex<BTreeMap<String, ScrapePool>>,
    /// Registered once here and cloned into every `ScrapePool`, since a
    /// `prometheus::Registry` rejects registering the same metric name
    /// twice. Spec.md line 174's skipped-tick counter.
    skipped_ticks: IntCounterVec,
}

impl ScrapeManager {
    pub fn new(appender: Arc<dyn Appender>, registry: &Registry) -> Self {
        let skipped_ticks = common::metrics::counter_vec(
            registry,
            "scrape_skipped_ticks_total",
            "Total number of scrape ticks skipped because the previous scrape was still running",
            &["job", "instance"],
        );
        Self {
            appender,
            pools: Mutex::new(BTreeMap::new()),
            skipped_ticks,
        }
    }

    /// Applies a full config snapshot: adds pools for new jobs, drops
    /// pools for removed jobs, and re-syncs every surviving pool against
    /// its job's freshly discovered targets.
    pub fn apply(&self, config: &Config) {
        let mut pools = self.pools.lock().unwrap();

        let job_names: std::collections::BTreeSet<&str> =
            config.scrape_configs.iter().map(|sc| sc.job_name.as_str()).collect();
        pools.retain(|name, _| job_names.contains(name.as_str()));

        for sc in &config.scrape_configs {
            let interval = sc.scrape_interval.unwrap_or(config.global.scrape_interval);
            let timeout = sc.scrape_timeout.unwrap_or(config.global.scrape_timeout);

            let pool = pools.entry(sc.job_name.clone()).or_insert_with(|| {
                ScrapePool::new(
                    sc.job_name.clone(),
                    interval,
                    timeout,
                    self.appender.clone(),
                    self.skipped_ticks.clone(),
                )
            });
            // `or_insert_with` only runs the closure above on first creation;
            // surviving pools need the freshly reloaded interval/timeout
            // pushed in explicitly, per spec.md's "push the new config into
            // the pool (which may change interval, timeout...)".
            pool.reconfigure(interval, timeout);

            let mut active = Vec::new();
            let mut dropped = Vec::new();
            for (profile_type, path) in &sc.profiling_config.types {
                for discovered in discover_static(sc) {
                    let mut labels = discovered.clone();
                    labels.set("__profile_path__", format!("{}{}", sc.profiling_config.path_prefix, path));
                    labels.set(common::labels::METRIC_NAME_LABEL, profile_type.clone());

                    match relabel(labels, &sc.relabel_configs) {
                        None => dropped.push(Arc::new(Target::new(discovered.clone(), discovered, String::new()))),
                        Some(labels) => match populate_labels(labels, &sc.job_name) {
                            Ok(labels) => match url_from_labels(&labels) {
                                Ok(url) => active.push(Arc::new(Target::new(labels.clone(), discovered, url))),
                                Err(_) => dropped.push(Arc::new(Target::new(labels.clone(), discovered, String::new()))),
                            },
                            Err(_) => dropped.push(Arc::new(Target::new(discovered.clone(), discovered, String::new()))),
                        },
                    }
                }
            }
            pool.sync(active, dropped);
        }
    }

    /// Spawns a task that calls `apply` every time the config watch
    /// channel publishes a new value, until the receiver is dropped.
    pub fn watch_config(self: Arc<Self>, mut rx: watch::Receiver<Arc<Config>>) {
        tokio::spawn(async move {
            loop {
                let config = rx.borrow_and_update().clone();
                self.apply(&config);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    pub fn targets_active(&self) -> BTreeMap<String, Vec<TargetSnapshot>> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.active_targets().iter().map(snapshot).collect()))
            .collect()
    }

    pub fn targets_dropped(&self) -> BTreeMap<String, Vec<TargetSnapshot>> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.dropped_targets().iter().map(snapshot).collect()))
            .collect()
    }
}

fn snapshot(target: &Arc<Target>) -> TargetSnapshot {
    TargetSnapshot {
        labels: target.labels.public(),
        discovered_labels: target.discovered_labels.to_map(),
        url: target.url.clone(),
        health: target.health(),
        last_error: target.last_error(),
        last_scrape_duration: target.last_scrape_duration(),
        skipped_scrapes: target.skipped_scrapes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::Result;
    use pconfig::Config;

    struct NoopAppender;
    impl Appender for NoopAppender {
        fn append(&self, _labels: &Labels, _ts: i64, _raw: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn apply_creates_a_pool_per_job() {
        let yaml = r#"
scrape_configs:
  - job_name: api
    static_configs:
      - targets: ["127.0.0.1:9000"]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let manager = ScrapeManager::new(Arc::new(NoopAppender), &Registry::new());
        manager.apply(&config);
        let active = manager.targets_active();
        assert!(active.contains_key("api"));
    }

    #[test]
    fn apply_drops_removed_jobs() {
        let manager = ScrapeManager::new(Arc::new(NoopAppender), &Registry::new());
        let with_job = Config::from_yaml(
            "scrape_configs:\n  - job_name: api\n    static_configs: [{targets: [\"a:1\"]}]\n",
        )
        .unwrap();
        manager.apply(&with_job);
        assert!(manager.targets_active().contains_key("api"));

        let without_job = Config::from_yaml("scrape_configs: []\n").unwrap();
        manager.apply(&without_job);
        assert!(!manager.targets_active().contains_key("api"));
    }
}
