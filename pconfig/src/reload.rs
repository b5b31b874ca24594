use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::error::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::Config;

/// Watches a config file and republishes a validated `Config` to every
/// subscriber whenever it changes on disk, or when `trigger()` is called
/// (the `/-/reload` endpoint's effect). Mirrors the reload channel wired
/// through `runAll` in the original all-in-one command: scrape manager and
/// API handlers all observe the same reload signal rather than each
/// re-reading the file themselves.
pub struct ConfigReloader {
    path: PathBuf,
    tx: watch::Sender<Arc<Config>>,
    _watcher: RecommendedWatcher,
}

impl ConfigReloader {
    /// Loads and validates the config once, then starts watching the file
    /// for further changes. Returns the reloader plus a receiver that
    /// always holds the latest successfully validated config.
    pub fn start(path: impl AsRef<Path>) -> Result<(Self, watch::Receiver<Arc<Config>>)> {
        let path = path.as_ref().to_path_buf();
        let initial = load_and_validate(&path)?;
        let (tx, rx) = watch::channel(Arc::new(initial));

        let watch_tx = tx.clone();
        let watch_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            if !event.kind.is_modify() && !event.kind.is_create() {
                return;
            }
            match load_and_validate(&watch_path) {
                Ok(cfg) => {
                    let _ = watch_tx.send(Arc::new(cfg));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "config reload failed validation, keeping previous config");
                }
            }
        })
        .map_err(|e| Error::Internal(format!("failed to start config watcher: {e}")))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("failed to watch config file: {e}")))?;

        Ok((
            Self {
                path,
                tx,
                _watcher: watcher,
            },
            rx.clone(),
        ))
    }

    /// Re-reads and republishes the config immediately, ignoring the file
    /// watcher debounce. Used by the manual reload endpoint.
    pub fn trigger(&self) -> Result<()> {
        let cfg = load_and_validate(&self.path)?;
        self.tx
            .send(Arc::new(cfg))
            .map_err(|_| Error::Internal("no config subscribers remain".into()))
    }

    /// The configuration file's raw text as it currently sits on disk,
    /// for the `/status/config` endpoint (`a.config.String()` in the
    /// original `api.go`'s `Config` handler).
    pub fn current_yaml(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Internal(format!("reading config file {:?}: {e}", self.path)))
    }
}

fn load_and_validate(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("reading config file {path:?}: {e}")))?;
    let cfg = Config::from_yaml(&raw)
        .map_err(|e| Error::BadRequest(format!("invalid config yaml: {e}")))?;
    cfg.validate().map_err(Error::BadRequest)?;
    Ok(cfg)
}
