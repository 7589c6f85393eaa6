use serde::Deserialize;

/// Top-level configuration for a queue node.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub retry: RetrySettings,
    pub retention: RetentionSettings,
    pub logging: LoggingSettings,
}

/// Where the store lives and how much work the writer thread may queue.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
    pub writer_queue_capacity: usize,
}

/// Retry policy applied to outgoing messages that do not set their own.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    pub default_max_attempts: u32,
}

/// How long messages moved to the `processed` sub-queue are kept.
///
/// `None` keeps them until the queue is cleared.
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionSettings {
    pub processed_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub store: Option<PartialStoreSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub retention: Option<PartialRetentionSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub writer_queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRetrySettings {
    pub default_max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRetentionSettings {
    pub processed_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings {
                path: "relayq_db".to_string(),
                writer_queue_capacity: 1024,
            },
            retry: RetrySettings {
                default_max_attempts: 100,
            },
            retention: RetentionSettings {
                processed_ttl_secs: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Default settings with the store rooted at `path`.
    pub fn with_path(path: impl Into<String>) -> Self {
        let mut settings = Self::default();
        settings.store.path = path.into();
        settings
    }
}
