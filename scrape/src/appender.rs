//! Write path from a completed scrape into the local `ProfileStore`.
//! Grounded on the teacher's `Appender`/`Appendable` trait split in
//! `appender.rs`, collapsed to a single local-store implementation since
//! there is no remote fan-out destination in this system.

use std::sync::Arc;
use std::time::Instant;

use common::error::Result;
use common::labels::Labels;
use common::metrics::histogram;
use prometheus::{Histogram, Registry};
use store::{ProfileKey, ProfileStore};

pub trait Appender: Send + Sync {
    fn append(&self, labels: &Labels, ts_unix_ms: i64, raw_profile: Vec<u8>) -> Result<()>;
}

pub struct StoreAppender {
    store: Arc<dyn ProfileStore>,
    write_latency: Histogram,
}

impl StoreAppender {
    pub fn new(store: Arc<dyn ProfileStore>, registry: &Registry) -> Self {
        let write_latency = histogram(
            registry,
            "scrape_append_latency_seconds",
            "Latency of writing a scraped profile to the store",
            prometheus::exponential_buckets(0.001, 2.0, 12).unwrap(),
        );
        Self {
            store,
            write_latency,
        }
    }
}

impl Appender for StoreAppender {
    fn append(&self, labels: &Labels, ts_unix_ms: i64, raw_profile: Vec<u8>) -> Result<()> {
        let start = Instant::now();
        let job = labels.get(common::labels::JOB_LABEL).unwrap_or("").to_string();
        let tp = labels.get(common::labels::METRIC_NAME_LABEL).unwrap_or("").to_string();
        let instance = labels.get(common::labels::INSTANCE_LABEL).unwrap_or("").to_string();

        let key = ProfileKey::new(ts_unix_ms, job, tp, instance).encode();
        let result = self.store.put(&key, &raw_profile);
        self.write_latency.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::RocksStore;

    #[test]
    fn append_writes_a_retrievable_key() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ProfileStore> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let registry = Registry::new();
        let appender = StoreAppender::new(store.clone(), &registry);

        let mut labels = Labels::new();
        labels.set("job", "api");
        labels.set("__name__", "cpu");
        labels.set("instance", "a:1");

        appender.append(&labels, 1000, b"payload".to_vec()).unwrap();

        let key = ProfileKey::new(1000, "api", "cpu", "a:1").encode();
        assert_eq!(store.get(&key).unwrap(), b"payload");
    }
}
