//! A single scrape target: a (url, labels) pair discovered from a job's
//! static or dynamic service discovery, plus its mutable scheduling and
//! health state. Grounded on the `Target`/`TargetHealth` shapes in the
//! teacher's `scrape/target.rs`; the fingerprint reuses
//! `common::labels::Labels::hash` rather than rolling its own digest,
//! folding the url in as an extra pseudo-label so the same stable xxhash
//! covers both.

use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::labels::Labels;

pub const ADDRESS_LABEL: &str = "__address__";
pub const SCHEME_LABEL: &str = "__scheme__";
pub const PROFILE_PATH_LABEL: &str = "__profile_path__";
pub const PARAM_LABEL_PREFIX: &str = "__param_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetHealth {
    Unknown,
    Good,
    Bad,
}

impl Default for TargetHealth {
    fn default() -> Self {
        TargetHealth::Unknown
    }
}

#[derive(Debug, Default)]
struct MutableState {
    health: TargetHealth,
    last_error: Option<String>,
    last_scrape_unix_ms: i64,
    last_scrape_duration: Duration,
    skipped_scrapes: u64,
}

/// A scrape endpoint. `url` and `fingerprint` are immutable for the life
/// of the target; scrape outcomes are tracked behind a lock so the HTTP
/// `targets` endpoint can read them concurrently with an in-flight scrape.
#[derive(Debug)]
pub struct Target {
    pub labels: Labels,
    pub discovered_labels: Labels,
    pub url: String,
    pub fingerprint: u64,
    state: RwLock<MutableState>,
}

impl Target {
    pub fn new(labels: Labels, discovered_labels: Labels, url: String) -> Self {
        let fingerprint = fingerprint(&labels, &url);
        Self {
            labels,
            discovered_labels,
            url,
            fingerprint,
            state: RwLock::new(MutableState::default()),
        }
    }

    pub fn public_labels(&self) -> Labels {
        Labels::from_iter(self.labels.public())
    }

    /// `instance` label value, or empty string if the target has none yet
    /// (e.g. a dropped target built before `populate_labels` ran).
    pub fn instance(&self) -> &str {
        self.labels.get(common::labels::INSTANCE_LABEL).unwrap_or("")
    }

    pub fn health(&self) -> TargetHealth {
        self.state.read().unwrap().health
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().unwrap().last_error.clone()
    }

    pub fn last_scrape_duration(&self) -> Duration {
        self.state.read().unwrap().last_scrape_duration
    }

    pub fn skipped_scrapes(&self) -> u64 {
        self.state.read().unwrap().skipped_scrapes
    }

    pub fn record_success(&self, started_unix_ms: i64, duration: Duration) {
        let mut s = self.state.write().unwrap();
        s.health = TargetHealth::Good;
        s.last_error = None;
        s.last_scrape_unix_ms = started_unix_ms;
        s.last_scrape_duration = duration;
    }

    pub fn record_failure(&self, started_unix_ms: i64, duration: Duration, err: impl ToString) {
        let mut s = self.state.write().unwrap();
        s.health = TargetHealth::Bad;
        s.last_error = Some(err.to_string());
        s.last_scrape_unix_ms = started_unix_ms;
        s.last_scrape_duration = duration;
    }

    pub fn record_skip(&self) {
        self.state.write().unwrap().skipped_scrapes += 1;
    }

    /// Deterministic per-target stagger inside one scrape interval, so
    /// targets discovered together don't all fire on the same tick.
    pub fn stagger_offset(&self, interval: Duration) -> Duration {
        if interval.is_zero() {
            return Duration::ZERO;
        }
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let interval_ns = interval.as_nanos().max(1);
        let base = now_ns % interval_ns;
        let offset = (self.fingerprint as u128) % interval_ns;
        let next = (base + offset) % interval_ns;
        Duration::from_nanos(next as u64)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}
impl Eq for Target {}

/// `__fingerprint_url__` can never collide with a real discovery label
/// (those are either bare names like `job` or `__meta_*`/`__address__`
/// style reserved labels), so folding the url in this way is safe.
const FINGERPRINT_URL_LABEL: &str = "__fingerprint_url__";

fn fingerprint(labels: &Labels, url: &str) -> u64 {
    let mut with_url = labels.clone();
    with_url.set(FINGERPRINT_URL_LABEL, url);
    with_url.hash()
}

/// Builds the scrape URL from `__address__` / `__scheme__` /
/// `__profile_path__` plus any `__param_*` labels, mirroring
/// `url_from_target` in the teacher's `target.rs`.
pub fn url_from_labels(labels: &Labels) -> Result<String, String> {
    let scheme = labels.get(SCHEME_LABEL).unwrap_or("http");
    let address = labels
        .get(ADDRESS_LABEL)
        .ok_or_else(|| "missing __address__ label".to_string())?;
    let path = labels.get(PROFILE_PATH_LABEL).unwrap_or("/debug/pprof/profile");

    let mut query = vec![];
    for (name, value) in labels.iter() {
        if let Some(param) = name.strip_prefix(PARAM_LABEL_PREFIX) {
            query.push(format!("{param}={value}"));
        }
    }

    let mut url = format!("{scheme}://{address}{path}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }
    Ok(url)
}

/// Fills in `job`/`instance`/scheme defaults and strips labels starting
/// with `RESERVED_LABEL_PREFIX` that aren't part of the public surface,
/// mirroring `populate_labels` in the teacher's `target.rs`.
pub fn populate_labels(mut labels: Labels, job_name: &str) -> Result<Labels, String> {
    if labels.get(common::labels::JOB_LABEL).is_none() {
        labels.set(common::labels::JOB_LABEL, job_name);
    }
    if labels.get(ADDRESS_LABEL).is_none() {
        return Err("no address".to_string());
    }
    if labels.get(common::labels::INSTANCE_LABEL).is_none() {
        let addr = labels.get(ADDRESS_LABEL).unwrap().to_string();
        labels.set(common::labels::INSTANCE_LABEL, addr);
    }
    // `__meta_*` discovery labels are dropped once they've been used to
    // populate the real label set; `__address__`/`__scheme__`/
    // `__profile_path__` survive since url_from_labels still needs them.
    let meta: Vec<String> = labels
        .iter()
        .filter(|(name, _)| name.starts_with("__meta_"))
        .map(|(name, _)| name.to_string())
        .collect();
    for name in meta {
        labels.del(&name);
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_equal_inputs() {
        let l1 = Labels::from_pairs([("job", "a"), ("instance", "x")]);
        let l2 = Labels::from_pairs([("instance", "x"), ("job", "a")]);
        assert_eq!(fingerprint(&l1, "http://x"), fingerprint(&l2, "http://x"));
    }

    #[test]
    fn fingerprint_differs_for_different_urls() {
        let l = Labels::from_pairs([("job", "a")]);
        assert_ne!(fingerprint(&l, "http://x"), fingerprint(&l, "http://y"));
    }

    #[test]
    fn stagger_offset_is_within_interval() {
        let t = Target::new(Labels::new(), Labels::new(), "http://x".into());
        let interval = Duration::from_secs(15);
        assert!(t.stagger_offset(interval) < interval);
    }

    #[test]
    fn url_from_labels_builds_expected_url() {
        let labels = Labels::from_pairs([
            (SCHEME_LABEL, "http"),
            (ADDRESS_LABEL, "127.0.0.1:9000"),
            (PROFILE_PATH_LABEL, "/debug/pprof/profile"),
        ]);
        assert_eq!(
            url_from_labels(&labels).unwrap(),
            "http://127.0.0.1:9000/debug/pprof/profile"
        );
    }
}
