pub mod config;
pub mod reload;

pub use config::{Config, GlobalConfig, ProfilingConfig, ScrapeConfig, StaticConfig, StorageConfig};
pub use reload::ConfigReloader;
