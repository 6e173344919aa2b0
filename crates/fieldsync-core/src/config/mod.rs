//! Sync configuration.
//!
//! `FieldsyncConfig` is the on-disk JSON file: engine tuning under `sync` and
//! the remote endpoint under `remote`. Every field is optional; missing values
//! take the defaults below.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::{BackoffPolicy, MergeTable};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_BATCH_SIZE: usize = 25;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
const DEFAULT_AUTH_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Reconciliation engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Descriptors pulled from the outbox per batch
    pub batch_size: usize,
    /// Failed attempts before a descriptor stalls
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the raw delay added as random jitter (0.0 to 1.0)
    pub backoff_jitter: f64,
    /// Consecutive auth failures that pause the engine
    pub auth_failure_threshold: u32,
    /// Periodic sync interval while foregrounded; 0 disables the timer
    pub sync_interval_secs: u64,
    /// Entity types fetched by the pull phase
    pub pull_entity_types: Vec<String>,
    /// Field-group overrides: `{ entity_type: { group: [fields] } }`
    pub merge_groups: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            auth_failure_threshold: DEFAULT_AUTH_FAILURE_THRESHOLD,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            pull_entity_types: vec![
                "equipment".to_string(),
                "panel_configuration".to_string(),
                "maintenance_session".to_string(),
            ],
            merge_groups: BTreeMap::new(),
        }
    }
}

impl SyncSettings {
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff base and cap
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.backoff_max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    #[must_use]
    pub const fn with_auth_failure_threshold(mut self, threshold: u32) -> Self {
        self.auth_failure_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs();
        self
    }

    #[must_use]
    pub fn with_pull_entity_types(mut self, entity_types: Vec<String>) -> Self {
        self.pull_entity_types = entity_types;
        self
    }

    /// Disable periodic sync (explicit triggers only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval_secs = 0;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("sync.batch_size must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("sync.max_attempts must be at least 1".to_string()));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(
                "sync.backoff_base_ms must be positive and not exceed sync.backoff_max_ms"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(Error::Config(
                "sync.backoff_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.auth_failure_threshold == 0 {
            return Err(Error::Config(
                "sync.auth_failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_jitter,
        )
    }

    /// Built-in merge groups with the configured overrides applied
    pub fn merge_table(&self) -> MergeTable {
        MergeTable::with_defaults().with_overrides(&self.merge_groups)
    }

    /// Periodic interval, `None` when auto sync is disabled
    pub const fn sync_interval(&self) -> Option<Duration> {
        if self.sync_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync_interval_secs))
        }
    }
}

/// Remote service endpoint and credential.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub api_url: Option<String>,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("api_url", &self.api_url)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(api_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            api_url: Some(api_url.into()),
            access_token: Some(access_token.into()),
        }
    }

    /// Fill unset fields from `fallback`.
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        Self {
            api_url: normalize_text_option(self.api_url)
                .or_else(|| normalize_text_option(fallback.api_url)),
            access_token: normalize_text_option(self.access_token)
                .or_else(|| normalize_text_option(fallback.access_token)),
        }
    }

    /// Check if both the endpoint and the credential are present
    pub const fn is_configured(&self) -> bool {
        self.api_url.is_some() && self.access_token.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        match self.api_url.as_deref() {
            Some(url) if !is_http_url(url.trim()) => Err(Error::Config(
                "remote.api_url must include http:// or https://".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldsyncConfig {
    pub sync: SyncSettings,
    pub remote: RemoteConfig,
    pub db_path: Option<String>,
}

impl FieldsyncConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| Error::Config(format!("invalid configuration JSON: {error}")))?;
        config.sync.validate()?;
        config.remote.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let settings = SyncSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.sync_interval(), Some(Duration::from_secs(60)));
        assert_eq!(settings.backoff().max_ms(), 300_000);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config = FieldsyncConfig::from_json(
            r#"{
                "sync": {
                    "max_attempts": 8,
                    "merge_groups": {"equipment": {"all": ["name", "status"]}}
                },
                "remote": {"api_url": "https://api.example.com"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.sync.max_attempts, 8);
        assert_eq!(config.sync.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.sync.merge_table().group_of("equipment", "status"), "all");
        assert!(!config.remote.is_configured());
    }

    #[test]
    fn unknown_fields_and_bad_ranges_are_rejected() {
        let error = FieldsyncConfig::from_json(r#"{"sync": {"retries": 3}}"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));

        let error = FieldsyncConfig::from_json(r#"{"sync": {"backoff_jitter": 2.5}}"#).unwrap_err();
        assert!(error.to_string().contains("backoff_jitter"));

        let error =
            FieldsyncConfig::from_json(r#"{"remote": {"api_url": "ftp://x"}}"#).unwrap_err();
        assert!(error.to_string().contains("api_url"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FieldsyncConfig::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, FieldsyncConfig::default());
    }

    #[test]
    fn remote_config_prefers_explicit_values_and_redacts_token() {
        let explicit = RemoteConfig {
            api_url: Some("  ".to_string()),
            access_token: Some("flag-token".to_string()),
        };
        let merged = explicit.or(RemoteConfig::new("https://env.example.com", "env-token"));
        assert_eq!(merged.api_url.as_deref(), Some("https://env.example.com"));
        assert_eq!(merged.access_token.as_deref(), Some("flag-token"));

        let debug = format!("{merged:?}");
        assert!(!debug.contains("flag-token"));
    }

    #[test]
    fn builders_chain() {
        let settings = SyncSettings::default()
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
            .without_auto_sync();
        assert_eq!(settings.max_attempts, 2);
        assert_eq!(settings.backoff_base_ms, 100);
        assert_eq!(settings.sync_interval(), None);
    }
}
