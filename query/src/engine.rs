//! Query Engine: turns a time range plus a set of equality label matchers
//! into profile data, in one of four modes — range scan, single nearest
//! profile, merge, and diff. Grounded on `api.go`'s `buildQueryRange`,
//! `findProfile`, `mergeProfiles`, and `DiffProfiles`.
//!
//! The profile key is `(ts, job, tp, instance)` with `ts` outermost, so the
//! scan bounds are built from the selector's leading-present fields
//! (`ts`, then `job`, then `tp`, then `instance` — stopping at the first
//! absent one), narrowing the single-seek range as far as the selector
//! allows. That still leaves a gap at timestamps strictly between `from`
//! and `to`, where entries for other jobs sharing that instant sort
//! between the bounds; every visited key is re-checked against the full
//! selector in-memory to catch those, and any predicate the prefix
//! couldn't encode.
//!
//! Each top-level call drives its own `QueryState` machine
//! (`Parsing -> Planning -> Scanning -> (Merging|Symbolizing)? -> Done`,
//! with `Cancelled`/`Failed` reachable from anywhere non-terminal) via
//! the private `QueryProgress` tracker, logging every transition.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::error::{Error, Result};
use pprof::protos::Profile;
use store::{ProfileKey, ProfileStore, RangeKey, VisitResult};
use tokio_util::sync::CancellationToken;

use crate::pprof_merge;
use crate::state::QueryState;
use crate::symbolizer::Symbolizer;

/// Drives one query's `QueryState` machine for the lifetime of a single
/// top-level `QueryEngine` call. Each call owns its own instance — nested
/// calls (`single`/`merge` calling `range_query`, `diff` calling
/// `single`/`merge`) track their own phase independently rather than
/// sharing one.
struct QueryProgress(QueryState);

impl QueryProgress {
    fn new() -> Self {
        Self(QueryState::Parsing)
    }

    fn advance(&mut self, next: QueryState) {
        if self.0.can_transition_to(next) {
            tracing::debug!(from = ?self.0, to = ?next, "query state transition");
            self.0 = next;
        }
    }
}

/// Equality-only selector; spec explicitly excludes a richer query
/// language, so this is a flat `label -> exact value` map matched
/// against each candidate key's job/profile-type/instance fields.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub job: Option<String>,
    pub profile_type: Option<String>,
    pub instance: Option<String>,
}

impl Selector {
    fn matches(&self, key: &ProfileKey) -> bool {
        self.job.as_deref().is_none_or_eq(&key.job)
            && self.profile_type.as_deref().is_none_or_eq(&key.tp)
            && self.instance.as_deref().is_none_or_eq(&key.instance)
    }

    /// Builds the narrowest `RangeKey` scan bound at timestamp `ts`,
    /// filling in `job`/`tp`/`instance` only while each leading field is
    /// present, per spec.md §4.7 step 1 ("using only leading-present
    /// fields"). A selector with `job` set but `profile_type` absent
    /// stops after `job`, even if `instance` happens to be set, since
    /// `RangeKey::encode_prefix` itself truncates at the first `None`
    /// and a `tp` gap would otherwise make the `instance` field
    /// meaningless in the encoded prefix.
    fn range_key(&self, ts: i64) -> RangeKey {
        let Some(job) = self.job.clone() else {
            return RangeKey { ts, ..Default::default() };
        };
        let Some(tp) = self.profile_type.clone() else {
            return RangeKey { ts, job: Some(job), ..Default::default() };
        };
        let instance = self.instance.clone();
        RangeKey {
            ts,
            job: Some(job),
            tp: Some(tp),
            instance,
        }
    }
}

trait OptionExt {
    fn is_none_or_eq(&self, other: &str) -> bool;
}
impl OptionExt for Option<&str> {
    fn is_none_or_eq(&self, other: &str) -> bool {
        match self {
            None => true,
            Some(v) => *v == other,
        }
    }
}

/// Sum of decoded-profile bytes a merge/diff query is allowed to load
/// before it's rejected, bounding worst-case memory use the way the
/// original's `--max-merge-batch-size` flag does.
const DEFAULT_MAX_MERGE_BYTES: usize = 64 * 1024 * 1024;

/// How far past/before the requested instant a single-point query will
/// search for a sample, matching the "`-5min` to `+5min`" staleness
/// window documented in `findProfile`.
const SINGLE_QUERY_WINDOW_MS: i64 = 5 * 60 * 1000;

pub struct QueryEngine {
    store: Arc<dyn ProfileStore>,
    symbolizer: Arc<dyn Symbolizer>,
    max_merge_bytes: usize,
    merge_size_hist: prometheus::Histogram,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn ProfileStore>, symbolizer: Arc<dyn Symbolizer>) -> Self {
        Self {
            store,
            symbolizer,
            max_merge_bytes: DEFAULT_MAX_MERGE_BYTES,
            merge_size_hist: unregistered_merge_size_histogram(),
        }
    }

    pub fn with_max_merge_bytes(mut self, bytes: usize) -> Self {
        self.max_merge_bytes = bytes;
        self
    }

    /// Attaches the merge-size histogram to a shared registry instead of
    /// the unregistered default one `new` builds, mirroring `a.mergeSizeHist`
    /// in the original's `api.New`, which always takes the process registry.
    pub fn with_registry(mut self, registry: &prometheus::Registry) -> Self {
        self.merge_size_hist = common::metrics::histogram(
            registry,
            "merge_size_num_profiles",
            "A histogram of number of profiles merged",
            prometheus::linear_buckets(10.0, 10.0, 10).unwrap(),
        );
        self
    }

    /// Raw (key, payload) pairs in `[from, to)` matching `selector`,
    /// checked against `cancel` between every visited record so a long
    /// scan can be aborted promptly rather than only at the boundaries.
    pub fn range_query(
        &self,
        from_ts: i64,
        to_ts: i64,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<Vec<(ProfileKey, Vec<u8>)>> {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        if to_ts < from_ts {
            progress.advance(QueryState::Failed);
            return Err(Error::BadRequest("to timestamp must not be before from time".into()));
        }
        let lo = selector.range_key(from_ts).encode_prefix();
        let hi = selector.range_key(to_ts).encode_prefix();

        progress.advance(QueryState::Scanning);
        let mut out = Vec::new();
        let mut scan_err = None;
        self.store.scan(&lo, &hi, &mut |k, v| {
            if cancel.is_cancelled() {
                return VisitResult::Stop;
            }
            match ProfileKey::decode(k) {
                Ok(key) if selector.matches(&key) => out.push((key, v.to_vec())),
                Ok(_) => {}
                Err(e) => scan_err = Some(e),
            }
            VisitResult::Continue
        })?;
        if cancel.is_cancelled() {
            progress.advance(QueryState::Cancelled);
            return Err(Error::Cancelled);
        }
        if let Some(e) = scan_err {
            progress.advance(QueryState::Failed);
            return Err(e);
        }
        progress.advance(QueryState::Done);
        Ok(out)
    }

    /// Distinct `(job, tp, instance)` combinations observed in
    /// `[from, to)` matching `selector`. A metadata-only scan: payload
    /// bytes are never read.
    pub fn series(
        &self,
        from_ts: i64,
        to_ts: i64,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        let lo = selector.range_key(from_ts).encode_prefix();
        let hi = selector.range_key(to_ts).encode_prefix();

        progress.advance(QueryState::Scanning);
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        self.store.scan(&lo, &hi, &mut |k, _v| {
            if cancel.is_cancelled() {
                return VisitResult::Stop;
            }
            if let Ok(key) = ProfileKey::decode(k) {
                if selector.matches(&key) {
                    let id = (key.job.clone(), key.tp.clone(), key.instance.clone());
                    if seen.insert(id) {
                        let mut m = BTreeMap::new();
                        m.insert("job".to_string(), key.job);
                        m.insert("__name__".to_string(), key.tp);
                        m.insert("instance".to_string(), key.instance);
                        out.push(m);
                    }
                }
            }
            VisitResult::Continue
        })?;
        if cancel.is_cancelled() {
            progress.advance(QueryState::Cancelled);
            return Err(Error::Cancelled);
        }
        progress.advance(QueryState::Done);
        Ok(out)
    }

    /// First profile whose timestamp is `>= requested_ts`, searched
    /// within `requested_ts +/- SINGLE_QUERY_WINDOW_MS`.
    pub fn single(
        &self,
        requested_ts: i64,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<Profile> {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        progress.advance(QueryState::Scanning);
        let candidates = self.range_query(
            requested_ts - SINGLE_QUERY_WINDOW_MS,
            requested_ts + SINGLE_QUERY_WINDOW_MS,
            selector,
            cancel,
        )?;
        let Some((_, bytes)) = candidates
            .into_iter()
            .filter(|(k, _)| k.ts >= requested_ts)
            .min_by_key(|(k, _)| k.ts)
        else {
            progress.advance(QueryState::Failed);
            return Err(Error::NotFound("no profile found in window".into()));
        };

        progress.advance(QueryState::Symbolizing);
        let mut profile = pprof_merge::decode(&bytes)?;
        self.symbolizer.symbolize(&mut profile)?;
        progress.advance(QueryState::Done);
        Ok(profile)
    }

    /// Decodes and structurally merges every profile in `[from, to)`
    /// matching `selector`, rejecting the query once the running total
    /// of decoded bytes exceeds `max_merge_bytes`.
    pub fn merge(
        &self,
        from_ts: i64,
        to_ts: i64,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<Profile> {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        progress.advance(QueryState::Scanning);
        let candidates = self.range_query(from_ts, to_ts, selector, cancel)?;
        if candidates.is_empty() {
            progress.advance(QueryState::Failed);
            return Err(Error::NotFound("no profiles found in range".into()));
        }

        progress.advance(QueryState::Merging);
        let mut budget = 0usize;
        let mut decoded = Vec::with_capacity(candidates.len());
        for (_, bytes) in candidates {
            if cancel.is_cancelled() {
                progress.advance(QueryState::Cancelled);
                return Err(Error::Cancelled);
            }
            budget += bytes.len();
            if budget > self.max_merge_bytes {
                progress.advance(QueryState::Failed);
                return Err(Error::ResourceExhausted(format!(
                    "merge query exceeded {} byte budget",
                    self.max_merge_bytes
                )));
            }
            decoded.push(pprof_merge::decode(&bytes)?);
        }

        self.merge_size_hist.observe(decoded.len() as f64);
        let mut merged = pprof_merge::merge(&decoded)?;
        progress.advance(QueryState::Symbolizing);
        self.symbolizer.symbolize(&mut merged)?;
        progress.advance(QueryState::Done);
        Ok(merged)
    }

    /// Computes `profile(spec_b) - profile(spec_a)` by tagging A's
    /// samples `pprof::base=true`, negating A's values, and merging A
    /// and B — the same trick the original's `DiffProfiles` uses instead
    /// of a dedicated subtraction routine.
    pub fn diff(&self, spec_a: ProfileSpec, spec_b: ProfileSpec, cancel: &CancellationToken) -> Result<Profile> {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        progress.advance(QueryState::Scanning);
        let resolved = (|| -> Result<(Profile, Profile)> {
            let profile_a = self.resolve(spec_a, cancel)?;
            let profile_b = self.resolve(spec_b, cancel)?;
            Ok((profile_a, profile_b))
        })();
        let (mut profile_a, profile_b) = match resolved {
            Ok(pair) => pair,
            Err(e) => {
                progress.advance(if matches!(e, Error::Cancelled) {
                    QueryState::Cancelled
                } else {
                    QueryState::Failed
                });
                return Err(e);
            }
        };

        progress.advance(QueryState::Merging);
        pprof_merge::set_label(&mut profile_a, "pprof::base", "true");
        pprof_merge::scale(&mut profile_a, -1);

        let merged = match pprof_merge::merge(&[profile_a, profile_b]) {
            Ok(m) => m,
            Err(e) => {
                progress.advance(QueryState::Failed);
                return Err(e);
            }
        };
        progress.advance(QueryState::Done);
        Ok(merged)
    }

    fn resolve(&self, spec: ProfileSpec, cancel: &CancellationToken) -> Result<Profile> {
        match spec {
            ProfileSpec::Single { ts, selector } => self.single(ts, &selector, cancel),
            ProfileSpec::Merge { from, to, selector } => self.merge(from, to, &selector, cancel),
        }
    }
}

pub enum ProfileSpec {
    Single { ts: i64, selector: Selector },
    Merge { from: i64, to: i64, selector: Selector },
}

/// A histogram that was never handed to a shared `Registry`; used as the
/// default so `QueryEngine::new` doesn't require a registry up front
/// (callers that want the metric exposed call `with_registry`).
fn unregistered_merge_size_histogram() -> prometheus::Histogram {
    prometheus::Histogram::with_opts(
        prometheus::HistogramOpts::new("merge_size_num_profiles", "A histogram of number of profiles merged")
            .buckets(prometheus::linear_buckets(10.0, 10.0, 10).unwrap()),
    )
    .expect("metric options are static and well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolizer::NoopSymbolizer;
    use pprof::protos::{Function, Line, Location, Sample};
    use protobuf::Message;
    use store::RocksStore;

    fn encode_test_profile(value: i64) -> Vec<u8> {
        let mut p = Profile::new();
        p.string_table.push(String::new());
        let mut f = Function::new();
        f.id = 1;
        p.function.push(f);
        let mut l = Location::new();
        l.id = 1;
        let mut line = Line::new();
        line.function_id = 1;
        l.line.push(line);
        p.location.push(l);
        let mut s = Sample::new();
        s.location_id.push(1);
        s.value.push(value);
        p.sample.push(s);
        p.write_to_bytes().unwrap()
    }

    fn test_engine() -> (tempfile::TempDir, QueryEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let engine = QueryEngine::new(store, Arc::new(NoopSymbolizer));
        (dir, engine)
    }

    #[test]
    fn range_key_stops_at_first_absent_selector_field() {
        let job_only = Selector {
            job: Some("api".into()),
            ..Default::default()
        };
        let key = job_only.range_key(1000);
        assert_eq!(key.job.as_deref(), Some("api"));
        assert_eq!(key.tp, None);

        let job_and_tp = Selector {
            job: Some("api".into()),
            profile_type: Some("cpu".into()),
            instance: Some("ignored-because-tp-gap".into()),
        };
        // `profile_type` is present so `job`+`tp` both encode, but the
        // implementation never needs to fall back past a present field.
        let key = job_and_tp.range_key(1000);
        assert_eq!(key.job.as_deref(), Some("api"));
        assert_eq!(key.tp.as_deref(), Some("cpu"));
        assert_eq!(key.instance.as_deref(), Some("ignored-because-tp-gap"));
    }

    #[test]
    fn range_query_narrows_scan_bounds_by_selector_but_still_filters_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ProfileStore> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let engine = QueryEngine::new(store.clone(), Arc::new(NoopSymbolizer));

        // Same timestamp, different job: sorts between the `job`-scoped
        // bounds and must be excluded by the in-memory selector check
        // even though the prefix alone can't rule it out.
        store
            .put(&ProfileKey::new(1000, "api", "cpu", "a:1").encode(), b"api-cpu")
            .unwrap();
        store
            .put(&ProfileKey::new(1000, "other", "cpu", "b:1").encode(), b"other-cpu")
            .unwrap();

        let selector = Selector {
            job: Some("api".into()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let rows = engine.range_query(0, 2000, &selector, &cancel).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.job, "api");
    }

    #[test]
    fn query_progress_follows_the_happy_path_and_ignores_backward_moves() {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        progress.advance(QueryState::Scanning);
        progress.advance(QueryState::Merging);
        // Scanning -> Merging already happened; going back to Scanning
        // isn't a valid forward move and must be ignored.
        progress.advance(QueryState::Scanning);
        assert_eq!(progress.0, QueryState::Merging);
        progress.advance(QueryState::Done);
        assert_eq!(progress.0, QueryState::Done);
    }

    #[test]
    fn query_progress_is_terminal_once_failed() {
        let mut progress = QueryProgress::new();
        progress.advance(QueryState::Planning);
        progress.advance(QueryState::Failed);
        progress.advance(QueryState::Scanning);
        assert_eq!(progress.0, QueryState::Failed);
    }

    #[test]
    fn range_query_rejects_to_before_from() {
        let (_dir, engine) = test_engine();
        let cancel = CancellationToken::new();
        let err = engine
            .range_query(2000, 1000, &Selector::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn single_finds_first_timestamp_at_or_after_request() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ProfileStore> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let engine = QueryEngine::new(store.clone(), Arc::new(NoopSymbolizer));
        let selector = Selector {
            job: Some("api".into()),
            profile_type: Some("cpu".into()),
            instance: Some("a:1".into()),
        };

        let key_before = ProfileKey::new(900_000, "api", "cpu", "a:1").encode();
        let key_after = ProfileKey::new(1_100_000, "api", "cpu", "a:1").encode();
        store.put(&key_before, &encode_test_profile(1)).unwrap();
        store.put(&key_after, &encode_test_profile(2)).unwrap();

        let cancel = CancellationToken::new();
        let profile = engine.single(1_000_000, &selector, &cancel).unwrap();
        assert_eq!(profile.sample[0].value[0], 2);
    }

    #[test]
    fn merge_enforces_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ProfileStore> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let engine = QueryEngine::new(store.clone(), Arc::new(NoopSymbolizer)).with_max_merge_bytes(4);

        let key = ProfileKey::new(1000, "api", "cpu", "a:1").encode();
        store.put(&key, &encode_test_profile(1)).unwrap();

        let selector = Selector {
            job: Some("api".into()),
            profile_type: Some("cpu".into()),
            instance: Some("a:1".into()),
        };
        let cancel = CancellationToken::new();
        let err = engine.merge(0, 2000, &selector, &cancel).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }
}
