//! Node configuration.
//!
//! Values are layered: built-in defaults, then an optional `config/default`
//! file (any format the `config` crate understands), then `RELAYQ_`-prefixed
//! environment variables using `__` between section and key, e.g.
//! `RELAYQ_STORE__PATH=/var/lib/relayq`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    LoggingSettings, RetentionSettings, RetrySettings, Settings, StoreSettings,
};

/// Loads configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads configuration from the given file (extension optional) and the
/// environment, merged over the defaults.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    // A missing .env is not an error.
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("RELAYQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        store: StoreSettings {
            path: partial
                .store
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.store.path),
            writer_queue_capacity: partial
                .store
                .as_ref()
                .and_then(|s| s.writer_queue_capacity)
                .unwrap_or(default.store.writer_queue_capacity),
        },
        retry: RetrySettings {
            default_max_attempts: partial
                .retry
                .as_ref()
                .and_then(|r| r.default_max_attempts)
                .unwrap_or(default.retry.default_max_attempts),
        },
        retention: RetentionSettings {
            processed_ttl_secs: partial
                .retention
                .as_ref()
                .and_then(|r| r.processed_ttl_secs)
                .or(default.retention.processed_ttl_secs),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}
