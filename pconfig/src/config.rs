use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retention() -> Duration {
    Duration::from_secs(15 * 24 * 3600)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_merge_batch_size() -> usize {
    64 * 1024 * 1024
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Top-level configuration document, analogous to a Prometheus `scrape_config`
/// file: a list of jobs plus the ambient options that govern storage and
/// logging for the whole process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default, rename = "scrape_configs")]
    pub scrape_configs: Vec<ScrapeConfig>,
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Rejects configs that would produce ambiguous or unschedulable jobs:
    /// duplicate job names, or a scrape_timeout longer than scrape_interval.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for sc in &self.scrape_configs {
            if !seen.insert(&sc.job_name) {
                return Err(format!("duplicate job_name: {}", sc.job_name));
            }
            let interval = sc.scrape_interval.unwrap_or_else(|| self.global.scrape_interval);
            let timeout = sc.scrape_timeout.unwrap_or_else(|| self.global.scrape_timeout);
            if timeout > interval {
                return Err(format!(
                    "job {}: scrape_timeout ({:?}) exceeds scrape_interval ({:?})",
                    sc.job_name, timeout, interval
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_scrape_interval", with = "humantime_duration")]
    pub scrape_interval: Duration,
    #[serde(default = "default_scrape_timeout", with = "humantime_duration")]
    pub scrape_timeout: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Wall-clock budget for a single query-engine request before the API
    /// layer cancels it and returns a timeout error.
    #[serde(default = "default_query_timeout", with = "humantime_duration")]
    pub query_timeout: Duration,
    /// Upper bound on the combined encoded size of profiles a merge/diff
    /// query will decode before failing with ResourceExhausted.
    #[serde(default = "default_max_merge_batch_size")]
    pub max_merge_batch_size: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
            log_level: default_log_level(),
            query_timeout: default_query_timeout(),
            max_merge_batch_size: default_max_merge_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_retention", with = "humantime_duration")]
    pub retention: Duration,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilingConfig {
    #[serde(default = "default_profiling_path")]
    pub path_prefix: String,
    /// profile type name -> URL path suffix, e.g. "cpu" -> "/debug/pprof/profile".
    #[serde(default = "default_profiling_types")]
    pub types: BTreeMap<String, String>,
}

fn default_profiling_path() -> String {
    "/debug/pprof".to_string()
}

fn default_profiling_types() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("cpu".to_string(), "/profile".to_string());
    m.insert("heap".to_string(), "/heap".to_string());
    m.insert("goroutine".to_string(), "/goroutine".to_string());
    m
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_profiling_path(),
            types: default_profiling_types(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelabelConfig {
    #[serde(default)]
    pub source_labels: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    pub regex: String,
    #[serde(default = "default_target_label")]
    pub target_label: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default = "default_relabel_action")]
    pub action: RelabelAction,
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_target_label() -> String {
    String::new()
}

fn default_replacement() -> String {
    "$1".to_string()
}

fn default_relabel_action() -> RelabelAction {
    RelabelAction::Replace
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelabelAction {
    Replace,
    Keep,
    Drop,
    LabelDrop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default, with = "option_humantime_duration")]
    pub scrape_interval: Option<Duration>,
    #[serde(default, with = "option_humantime_duration")]
    pub scrape_timeout: Option<Duration>,
    #[serde(default)]
    pub profiling_config: ProfilingConfig,
    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,
    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,
}

mod option_humantime_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
scrape_configs:
  - job_name: api
    static_configs:
      - targets: ["127.0.0.1:9000"]
        labels:
          env: prod
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.scrape_configs.len(), 1);
        assert_eq!(cfg.scrape_configs[0].job_name, "api");
        assert_eq!(
            cfg.scrape_configs[0].static_configs[0].targets[0],
            "127.0.0.1:9000"
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_job_names() {
        let yaml = r#"
scrape_configs:
  - job_name: api
    static_configs: [{targets: ["a:1"]}]
  - job_name: api
    static_configs: [{targets: ["b:1"]}]
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_timeout_exceeding_interval() {
        let yaml = r#"
scrape_configs:
  - job_name: api
    scrape_interval: 5s
    scrape_timeout: 10s
    static_configs: [{targets: ["a:1"]}]
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
