//! Turns a job's `static_configs` into label sets, then applies
//! `relabel_configs` the way Prometheus does: join the source labels with
//! the separator, match the regex against the joined string, and replace,
//! keep, drop, or drop a label depending on the action.

use common::labels::Labels;
use pconfig::config::{RelabelAction, RelabelConfig, ScrapeConfig};
use regex::Regex;

/// One entry per statically configured target, labels merged from the
/// group's shared labels and the target's own `__address__`.
pub fn discover_static(cfg: &ScrapeConfig) -> Vec<Labels> {
    let mut out = Vec::new();
    for sc in &cfg.static_configs {
        for target in &sc.targets {
            let mut labels = Labels::from_pairs(sc.labels.clone());
            labels.set("__address__", target.clone());
            labels.set("__scheme__", "http");
            out.push(labels);
        }
    }
    out
}

/// Applies every relabel rule in order; `None` means the target was
/// dropped.
pub fn relabel(mut labels: Labels, rules: &[RelabelConfig]) -> Option<Labels> {
    for rule in rules {
        let joined = rule
            .source_labels
            .iter()
            .map(|name| labels.get(name).unwrap_or("").to_string())
            .collect::<Vec<_>>()
            .join(&rule.separator);

        let re = match Regex::new(&rule.regex) {
            Ok(re) => re,
            Err(_) => continue,
        };
        let is_match = re.is_match(&joined);

        match rule.action {
            RelabelAction::Keep => {
                if !is_match {
                    return None;
                }
            }
            RelabelAction::Drop => {
                if is_match {
                    return None;
                }
            }
            RelabelAction::LabelDrop => {
                if is_match {
                    labels.del(&rule.target_label);
                }
            }
            RelabelAction::Replace => {
                if is_match && !rule.target_label.is_empty() {
                    let replacement = re.replace(&joined, rule.replacement.as_str());
                    labels.set(rule.target_label.clone(), replacement.into_owned());
                }
            }
        }
    }
    Some(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pconfig::config::StaticConfig;
    use std::collections::BTreeMap;

    fn rule(action: RelabelAction) -> RelabelConfig {
        RelabelConfig {
            source_labels: vec!["job".to_string()],
            separator: ";".to_string(),
            regex: "api".to_string(),
            target_label: "env".to_string(),
            replacement: "prod".to_string(),
            action,
        }
    }

    #[test]
    fn discover_static_produces_one_target_per_address() {
        let cfg = ScrapeConfig {
            job_name: "api".to_string(),
            scrape_interval: None,
            scrape_timeout: None,
            profiling_config: Default::default(),
            static_configs: vec![StaticConfig {
                targets: vec!["a:1".to_string(), "b:1".to_string()],
                labels: BTreeMap::new(),
            }],
            relabel_configs: vec![],
        };
        let targets = discover_static(&cfg);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].get("__address__"), Some("a:1"));
    }

    #[test]
    fn relabel_drop_removes_target() {
        let mut labels = Labels::new();
        labels.set("job", "api");
        assert!(relabel(labels, &[rule(RelabelAction::Drop)]).is_none());
    }

    #[test]
    fn relabel_keep_rejects_non_matching() {
        let mut labels = Labels::new();
        labels.set("job", "other");
        assert!(relabel(labels, &[rule(RelabelAction::Keep)]).is_none());
    }

    #[test]
    fn relabel_replace_sets_target_label() {
        let mut labels = Labels::new();
        labels.set("job", "api");
        let out = relabel(labels, &[rule(RelabelAction::Replace)]).unwrap();
        assert_eq!(out.get("env"), Some("prod"));
    }
}
