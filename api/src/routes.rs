//! HTTP route handlers: one per spec.md §6 endpoint, each parsing its own
//! query parameters into a typed record (DESIGN NOTES §9) and delegating
//! to `query::QueryEngine` / `scrape::ScrapeManager` / `pconfig`.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::error::Error;
use query::{ProfileSpec, Selector};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::selector::{parse_metric_selector, parse_query_range_selector};
use crate::state::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/query_range", get(query_range))
        .route("/api/v1/query", get(query))
        .route("/api/v1/series", get(series))
        .route("/api/v1/labels", get(label_names))
        .route("/api/v1/label/:name/values", get(label_values))
        .route("/api/v1/targets", get(targets))
        .route("/api/v1/status/config", get(status_config))
        .route("/-/reload", post(reload))
        .route("/-/healthy", get(healthy))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
struct Envelope<T: Serialize> {
    status: &'static str,
    data: T,
    warnings: Vec<String>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "success",
        data,
        warnings: Vec::new(),
    })
}

fn parse_time_ms(raw: &str) -> Result<i64, Error> {
    raw.parse::<i64>()
        .map_err(|_| Error::BadRequest(format!("cannot parse {raw:?} as a millisecond timestamp")))
}

/// Runs a blocking `QueryEngine` call on a worker thread, racing it
/// against `query_timeout`; on timeout the shared `CancellationToken` is
/// fired so the scan driver can stop between records, per spec.md §4.7's
/// "Cancellation and timeout" clause.
async fn with_timeout<T, F>(timeout: Duration, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, Error> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let cancel_for_task = cancel.clone();
    let handle = tokio::task::spawn_blocking(move || f(&cancel_for_task));

    tokio::select! {
        result = handle => result.map_err(|e| Error::Internal(format!("query task panicked: {e}")))?,
        _ = tokio::time::sleep(timeout) => {
            cancel.cancel();
            Err(Error::Cancelled)
        }
    }
}

#[derive(Deserialize)]
struct QueryRangeParams {
    from: String,
    to: String,
    query: String,
    limit: Option<usize>,
}

async fn query_range(
    State(state): State<ApiState>,
    Query(params): Query<QueryRangeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let from = parse_time_ms(&params.from)?;
    let to = parse_time_ms(&params.to)?;
    let selector = parse_query_range_selector(&params.query)?;
    let limit = params.limit;

    let engine = state.engine.clone();
    let series = with_timeout(state.query_timeout, move |cancel| {
        let rows = engine.range_query(from, to, &selector, cancel)?;
        Ok(group_into_series(rows, limit))
    })
    .await?;

    Ok(ok(series))
}

#[derive(Serialize)]
struct SeriesOut {
    labels: BTreeMap<String, String>,
    timestamps: Vec<i64>,
}

/// Groups scan-ordered rows into `Series`, starting a new one whenever
/// the `(job, tp, instance)` identity changes, per spec.md §4.7 step 5.
fn group_into_series(rows: Vec<(store::ProfileKey, Vec<u8>)>, limit: Option<usize>) -> Vec<SeriesOut> {
    let mut out: Vec<(store::ProfileKey, SeriesOut)> = Vec::new();
    let mut count = 0usize;

    for (key, _) in rows {
        if let Some(l) = limit {
            if count >= l {
                break;
            }
        }
        count += 1;

        let starts_new = match out.last() {
            Some((last_key, _)) => {
                last_key.job != key.job || last_key.tp != key.tp || last_key.instance != key.instance
            }
            None => true,
        };

        if starts_new {
            let mut labels = BTreeMap::new();
            labels.insert("job".to_string(), key.job.clone());
            labels.insert("__name__".to_string(), key.tp.clone());
            labels.insert("instance".to_string(), key.instance.clone());
            out.push((
                key.clone(),
                SeriesOut {
                    labels,
                    timestamps: vec![key.ts],
                },
            ));
        } else {
            let (last_key, series) = out.last_mut().unwrap();
            series.timestamps.push(key.ts);
            *last_key = key;
        }
    }

    out.into_iter().map(|(_, s)| s).collect()
}

#[derive(Deserialize)]
struct QueryParams {
    mode: Option<String>,
    time: Option<String>,
    query: Option<String>,
    from: Option<String>,
    to: Option<String>,
    mode_a: Option<String>,
    time_a: Option<String>,
    query_a: Option<String>,
    from_a: Option<String>,
    to_a: Option<String>,
    mode_b: Option<String>,
    time_b: Option<String>,
    query_b: Option<String>,
    from_b: Option<String>,
    to_b: Option<String>,
}

fn build_spec(
    mode: Option<&str>,
    time: Option<&str>,
    query: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<ProfileSpec, Error> {
    match mode.unwrap_or("single") {
        "merge" => {
            let from = parse_time_ms(from.ok_or_else(|| Error::BadRequest("missing \"from\"".into()))?)?;
            let to = parse_time_ms(to.ok_or_else(|| Error::BadRequest("missing \"to\"".into()))?)?;
            if to < from {
                return Err(Error::BadRequest("to timestamp must not be before from time".into()));
            }
            let selector = parse_metric_selector(query.unwrap_or_default())?;
            Ok(ProfileSpec::Merge { from, to, selector })
        }
        "single" => {
            let ts = parse_time_ms(time.ok_or_else(|| Error::BadRequest("missing \"time\"".into()))?)?;
            let selector = parse_metric_selector(query.unwrap_or_default())?;
            Ok(ProfileSpec::Single { ts, selector })
        }
        other => Err(Error::BadRequest(format!("unsupported mode: {other}"))),
    }
}

async fn query(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let mode = params.mode.as_deref().unwrap_or("single");

    let profile = if mode == "diff" {
        let spec_a = build_spec(
            params.mode_a.as_deref(),
            params.time_a.as_deref(),
            params.query_a.as_deref(),
            params.from_a.as_deref(),
            params.to_a.as_deref(),
        )?;
        let spec_b = build_spec(
            params.mode_b.as_deref(),
            params.time_b.as_deref(),
            params.query_b.as_deref(),
            params.from_b.as_deref(),
            params.to_b.as_deref(),
        )?;
        with_timeout(state.query_timeout, move |cancel| engine.diff(spec_a, spec_b, cancel)).await?
    } else {
        let spec = build_spec(
            Some(mode),
            params.time.as_deref(),
            params.query.as_deref(),
            params.from.as_deref(),
            params.to.as_deref(),
        )?;
        with_timeout(state.query_timeout, move |cancel| match spec {
            ProfileSpec::Single { ts, selector } => engine.single(ts, &selector, cancel),
            ProfileSpec::Merge { from, to, selector } => engine.merge(from, to, &selector, cancel),
        })
        .await?
    };

    let bytes = query::pprof_merge::encode(&profile).map_err(ApiError::from)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

#[derive(Deserialize)]
struct MetadataParams {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

/// `[start, end)` for metadata endpoints: defaults to the last 24h,
/// matching the original's `defaultMetadataTimeRange`.
const DEFAULT_METADATA_RANGE_MS: i64 = 24 * 3600 * 1000;

fn metadata_range(params: &MetadataParams, now_ms: i64) -> Result<(i64, i64), Error> {
    let start = match &params.start {
        Some(s) => parse_time_ms(s)?,
        None => now_ms - DEFAULT_METADATA_RANGE_MS,
    };
    let end = match &params.end {
        Some(s) => parse_time_ms(s)?,
        None => now_ms,
    };
    if end < start {
        return Err(Error::BadRequest("end timestamp must not be before start time".into()));
    }
    Ok((start, end))
}

async fn series(
    State(state): State<ApiState>,
    Query(params): Query<MetadataParams>,
) -> Result<impl IntoResponse, ApiError> {
    let now_ms = unix_ms_now();
    let (start, end) = metadata_range(&params, now_ms)?;
    let selector = match &params.query {
        Some(q) if !q.is_empty() => parse_metric_selector(q)?,
        _ => Selector::default(),
    };

    let engine = state.engine.clone();
    let out = with_timeout(state.query_timeout, move |cancel| engine.series(start, end, &selector, cancel)).await?;
    Ok(ok(out))
}

async fn label_names(
    State(state): State<ApiState>,
    Query(params): Query<MetadataParams>,
) -> Result<impl IntoResponse, ApiError> {
    let now_ms = unix_ms_now();
    let (start, end) = metadata_range(&params, now_ms)?;
    let selector = match &params.query {
        Some(q) if !q.is_empty() => parse_metric_selector(q)?,
        _ => Selector::default(),
    };

    let engine = state.engine.clone();
    let all_series = with_timeout(state.query_timeout, move |cancel| engine.series(start, end, &selector, cancel)).await?;

    let mut names = std::collections::BTreeSet::new();
    for s in all_series {
        for k in s.keys() {
            names.insert(k.clone());
        }
    }
    Ok(ok(names.into_iter().collect::<Vec<_>>()))
}

async fn label_values(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<MetadataParams>,
) -> Result<impl IntoResponse, ApiError> {
    let now_ms = unix_ms_now();
    let (start, end) = metadata_range(&params, now_ms)?;
    let selector = match &params.query {
        Some(q) if !q.is_empty() => parse_metric_selector(q)?,
        _ => Selector::default(),
    };

    let engine = state.engine.clone();
    let all_series = with_timeout(state.query_timeout, move |cancel| engine.series(start, end, &selector, cancel)).await?;

    let mut values = std::collections::BTreeSet::new();
    for s in all_series {
        if let Some(v) = s.get(&name) {
            values.insert(v.clone());
        }
    }
    Ok(ok(values.into_iter().collect::<Vec<_>>()))
}

fn unix_ms_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Deserialize)]
struct TargetsParams {
    state: Option<String>,
}

#[derive(Serialize)]
struct TargetOut {
    discovered_labels: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    scrape_pool: String,
    scrape_url: String,
    last_error: String,
    last_scrape_duration: f64,
    health: &'static str,
    skipped_scrapes: u64,
}

#[derive(Serialize)]
struct DroppedTargetOut {
    discovered_labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct TargetDiscovery {
    active_targets: Vec<TargetOut>,
    dropped_targets: Vec<DroppedTargetOut>,
}

async fn targets(
    State(state): State<ApiState>,
    Query(params): Query<TargetsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let requested = params.state.as_deref().unwrap_or("any").to_lowercase();
    let show_active = requested.is_empty() || requested == "any" || requested == "active";
    let show_dropped = requested.is_empty() || requested == "any" || requested == "dropped";

    let mut active_targets = Vec::new();
    if show_active {
        for (pool, snaps) in state.scrape_manager.targets_active() {
            for snap in snaps {
                active_targets.push(TargetOut {
                    discovered_labels: snap.discovered_labels,
                    labels: snap.labels,
                    scrape_pool: pool.clone(),
                    scrape_url: snap.url,
                    last_error: snap.last_error.unwrap_or_default(),
                    last_scrape_duration: snap.last_scrape_duration.as_secs_f64(),
                    health: match snap.health {
                        scrape::TargetHealth::Unknown => "unknown",
                        scrape::TargetHealth::Good => "up",
                        scrape::TargetHealth::Bad => "down",
                    },
                    skipped_scrapes: snap.skipped_scrapes,
                });
            }
        }
    }

    let mut dropped_targets = Vec::new();
    if show_dropped {
        for (_, snaps) in state.scrape_manager.targets_dropped() {
            for snap in snaps {
                dropped_targets.push(DroppedTargetOut {
                    discovered_labels: snap.discovered_labels,
                });
            }
        }
    }

    Ok(ok(TargetDiscovery {
        active_targets,
        dropped_targets,
    }))
}

#[derive(Serialize)]
struct ConfigOut {
    yaml: String,
}

async fn status_config(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let yaml = state.reloader.current_yaml().map_err(ApiError::from)?;
    Ok(ok(ConfigOut { yaml }))
}

async fn reload(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    state.reloader.trigger().map_err(ApiError::from)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn healthy() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = state.registry.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }
    (axum::http::StatusCode::OK, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::ProfileKey;

    #[test]
    fn group_into_series_splits_on_identity_change() {
        let rows = vec![
            (ProfileKey::new(1000, "a", "cpu", "i1"), vec![]),
            (ProfileKey::new(2000, "a", "cpu", "i1"), vec![]),
            (ProfileKey::new(1500, "b", "cpu", "i1"), vec![]),
        ];
        let series = group_into_series(rows, None);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].timestamps, vec![1000, 2000]);
        assert_eq!(series[1].timestamps, vec![1500]);
    }

    #[test]
    fn group_into_series_respects_limit() {
        let rows = vec![
            (ProfileKey::new(1000, "a", "cpu", "i1"), vec![]),
            (ProfileKey::new(2000, "a", "cpu", "i1"), vec![]),
        ];
        let series = group_into_series(rows, Some(1));
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].timestamps, vec![1000]);
    }
}
