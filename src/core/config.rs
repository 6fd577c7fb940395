//! Service configuration
//!
//! Loaded from TOML; every section has defaults so a partial file is valid.
//! [`Config::validate`] must pass before anything is started.
//!
//! ```toml
//! [audit]
//! pool_size = 3
//! records_buffer_size = 300
//! max_sync_time_ms = 500
//!
//! [store]
//! health_check_interval_ms = 1000
//!
//! [log]
//! level = "debug"
//! ```

use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Default list key for audit batches
pub const DEFAULT_AUDIT_KEY: &str = "iam-authorization-analytics";

/// Default context key carrying the authenticated subject
pub const DEFAULT_SUBJECT_CONTEXT_KEY: &str = "username";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub audit: AuditOptions,
    #[validate(nested)]
    pub store: StoreOptions,
    #[validate(nested)]
    pub authorization: AuthorizationOptions,
    #[validate(nested)]
    pub log: LogOptions,
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Field validation plus cross-field checks
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;

        if self.audit.flush_threshold > self.audit.records_buffer_size {
            return Err(AuthzError::Config(format!(
                "audit.flush_threshold {} exceeds audit.records_buffer_size {}",
                self.audit.flush_threshold, self.audit.records_buffer_size
            )));
        }
        Ok(())
    }
}

/// Which usernames produce audit records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilters {
    /// When non-empty, only these usernames are recorded
    pub usernames: Vec<String>,
    /// Never recorded
    pub skipped_usernames: Vec<String>,
}

impl AuditFilters {
    pub fn should_record(&self, username: &str) -> bool {
        if self.skipped_usernames.iter().any(|u| u == username) {
            return false;
        }
        self.usernames.is_empty() || self.usernames.iter().any(|u| u == username)
    }
}

/// Audit pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuditOptions {
    /// Worker threads draining the queue
    #[validate(range(min = 1, max = 256))]
    pub pool_size: usize,

    /// Queue capacity; senders block once it is full
    #[validate(range(min = 1))]
    pub records_buffer_size: usize,

    /// Records a worker buffers before flushing (0 derives it from the queue size)
    pub flush_threshold: usize,

    /// Longest time a worker holds buffered records, in milliseconds
    #[validate(range(min = 1, max = 1000))]
    pub max_sync_time_ms: u64,

    /// Retention requested for stored records, in seconds
    #[validate(range(min = 1))]
    pub storage_expiration_secs: u64,

    /// Include serialized request and policies in records
    pub detailed_recording: bool,

    /// List key batches are appended to
    #[validate(length(min = 1))]
    pub key: String,

    pub filters: AuditFilters,
}

impl AuditOptions {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.max_sync_time_ms)
    }

    pub fn storage_expiration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.storage_expiration_secs).unwrap_or(i64::MAX))
    }

    /// Effective per-worker batch size
    pub fn batch_size(&self) -> usize {
        if self.flush_threshold > 0 {
            return self.flush_threshold;
        }
        (self.records_buffer_size / self.pool_size.max(1)).max(1)
    }
}

impl Default for AuditOptions {
    fn default() -> Self {
        AuditOptions {
            pool_size: 3,
            records_buffer_size: 300,
            flush_threshold: 0,
            max_sync_time_ms: 500,
            storage_expiration_secs: 24 * 60 * 60,
            detailed_recording: true,
            key: DEFAULT_AUDIT_KEY.to_string(),
            filters: AuditFilters::default(),
        }
    }
}

/// Backing store keys and health checking
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreOptions {
    #[validate(range(min = 1))]
    pub health_check_interval_ms: u64,

    #[validate(range(min = 1))]
    pub probe_timeout_ms: u64,

    #[validate(length(min = 1))]
    pub policies_key: String,

    #[validate(length(min = 1))]
    pub secrets_key: String,

    /// Channel carrying cache invalidation notices
    #[validate(length(min = 1))]
    pub notification_channel: String,
}

impl StoreOptions {
    pub fn connection_options(&self) -> crate::store::ConnectionOptions {
        crate::store::ConnectionOptions {
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            health_check_interval_ms: 1000,
            probe_timeout_ms: 5000,
            policies_key: "iam-policies".to_string(),
            secrets_key: "iam-secrets".to_string(),
            notification_channel: "iam.cluster.notifications".to_string(),
        }
    }
}

/// Decision engine settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuthorizationOptions {
    /// Context key the identity layer stores the authenticated subject under
    #[validate(length(min = 1))]
    pub subject_context_key: String,

    /// Compiled patterns kept in memory
    #[validate(range(min = 1))]
    pub pattern_cache_size: usize,
}

impl Default for AuthorizationOptions {
    fn default() -> Self {
        AuthorizationOptions {
            subject_context_key: DEFAULT_SUBJECT_CONTEXT_KEY.to_string(),
            pattern_cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LogOptions {
    /// Default tracing filter directive (overridden by RUST_LOG)
    #[validate(length(min = 1))]
    pub level: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: "info".to_string(),
        }
    }
}
