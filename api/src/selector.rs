//! Parameter parsing at the edge: every query-string shape this API
//! accepts is parsed once into a typed record here, per DESIGN NOTES §9
//! ("model each endpoint's parameter set as a named record ... a single
//! parse step at the edge"). Two grammars are supported, both named in
//! spec.md §4.7/§6:
//!
//! - the `query_range` grammar: comma-separated `field=value` pairs.
//! - the single/merge/diff grammar: a PromQL-style label-matcher
//!   selector, `{label="value", ...}` with an optional leading bare
//!   metric name standing in for `__name__`. Only equality matchers are
//!   supported, matching spec.md §1's Non-goal ("query-language
//!   expression evaluation beyond equality").

use common::error::Error;
use query::Selector;

/// Parses the `query_range` grammar: `job=a,tp=cpu,instance=10.0.0.1:80`.
/// Unknown fields are a `BadRequest`, matching spec.md §4.7 step 1.
pub fn parse_query_range_selector(raw: &str) -> Result<Selector, Error> {
    if raw.trim().is_empty() {
        return Err(Error::BadRequest("query cannot be empty".into()));
    }
    let mut selector = Selector::default();
    for cond in raw.split(',') {
        let mut parts = cond.splitn(2, '=');
        let field = parts.next().unwrap_or("").trim();
        let value = parts
            .next()
            .ok_or_else(|| Error::BadRequest(format!("invalid query condition: {cond}")))?
            .trim();
        match field {
            "job" => selector.job = Some(value.to_string()),
            "tp" => selector.profile_type = Some(value.to_string()),
            "instance" => selector.instance = Some(value.to_string()),
            other => return Err(Error::BadRequest(format!("unknown field: {other}"))),
        }
    }
    Ok(selector)
}

/// Parses a PromQL-style metric selector: `name{label="value",...}`,
/// `{label="value"}`, or a bare `name`. `name` (if present) populates
/// `profile_type`; recognized labels are `job`, `instance`, and
/// `__name__` (an explicit alias for the profile type).
pub fn parse_metric_selector(raw: &str) -> Result<Selector, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::BadRequest("query cannot be empty".into()));
    }

    let mut selector = Selector::default();
    let (name, body) = match raw.find('{') {
        Some(idx) => {
            let name = raw[..idx].trim();
            let rest = raw[idx..].trim();
            let body = rest
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| Error::BadRequest(format!("unterminated selector: {raw}")))?;
            (name, body)
        }
        None => (raw, ""),
    };

    if !name.is_empty() {
        selector.profile_type = Some(name.to_string());
    }

    for pair in body.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut kv = pair.splitn(2, '=');
        let label = kv.next().unwrap_or("").trim();
        let value = kv
            .next()
            .ok_or_else(|| Error::BadRequest(format!("invalid label matcher: {pair}")))?
            .trim()
            .trim_matches('"');
        match label {
            "job" => selector.job = Some(value.to_string()),
            "instance" => selector.instance = Some(value.to_string()),
            "__name__" | "tp" => selector.profile_type = Some(value.to_string()),
            other => return Err(Error::BadRequest(format!("unknown label: {other}"))),
        }
    }

    Ok(selector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_range_selector_parses_known_fields() {
        let s = parse_query_range_selector("job=a,tp=cpu,instance=10.0.0.1:80").unwrap();
        assert_eq!(s.job.as_deref(), Some("a"));
        assert_eq!(s.profile_type.as_deref(), Some("cpu"));
        assert_eq!(s.instance.as_deref(), Some("10.0.0.1:80"));
    }

    #[test]
    fn query_range_selector_rejects_unknown_field() {
        assert!(parse_query_range_selector("nope=1").is_err());
    }

    #[test]
    fn query_range_selector_rejects_empty() {
        assert!(parse_query_range_selector("").is_err());
    }

    #[test]
    fn metric_selector_parses_bare_name() {
        let s = parse_metric_selector("cpu").unwrap();
        assert_eq!(s.profile_type.as_deref(), Some("cpu"));
    }

    #[test]
    fn metric_selector_parses_braces() {
        let s = parse_metric_selector(r#"{job="api", instance="a:1", __name__="cpu"}"#).unwrap();
        assert_eq!(s.job.as_deref(), Some("api"));
        assert_eq!(s.instance.as_deref(), Some("a:1"));
        assert_eq!(s.profile_type.as_deref(), Some("cpu"));
    }

    #[test]
    fn metric_selector_name_plus_braces() {
        let s = parse_metric_selector(r#"cpu{job="api"}"#).unwrap();
        assert_eq!(s.profile_type.as_deref(), Some("cpu"));
        assert_eq!(s.job.as_deref(), Some("api"));
    }
}
