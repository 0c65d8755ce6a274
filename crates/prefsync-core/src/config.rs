//! Configuration types for the prefsync system
//!
//! This module defines all configuration structures used throughout the crate.
//!
//! Mailing-list credentials are optional at this level: a missing value is
//! not a validation failure but a per-sync configuration error, reported
//! when the engine resolves a [`ListTarget`].

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::traits::ListTarget;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest batch the backfill may commit at once
pub const MAX_BACKFILL_BATCH_SIZE: usize = 500;

/// Main prefsync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Mailing-list service settings
    #[serde(default)]
    pub mailing_list: MailingListConfig,

    /// Retry policy for external calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Bulk backfill settings
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.backfill.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Mailing-list service settings
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MailingListConfig {
    /// API key (never logged)
    pub api_key: Option<String>,

    /// Server prefix / data-center routing (e.g. "us21")
    pub server_prefix: Option<String>,

    /// Target list (audience) identifier
    pub list_id: Option<String>,
}

impl std::fmt::Debug for MailingListConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailingListConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("server_prefix", &self.server_prefix)
            .field("list_id", &self.list_id)
            .finish()
    }
}

impl MailingListConfig {
    /// Create a fully populated configuration
    pub fn new(
        api_key: impl Into<String>,
        server_prefix: impl Into<String>,
        list_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: Some(api_key.into()),
            server_prefix: Some(server_prefix.into()),
            list_id: Some(list_id.into()),
        }
    }

    /// Names of required values that are absent or empty
    pub fn missing_values(&self) -> Vec<&'static str> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        if !present(&self.api_key) {
            missing.push("API_KEY");
        }
        if !present(&self.server_prefix) {
            missing.push("SERVER_PREFIX");
        }
        if !present(&self.list_id) {
            missing.push("LIST_ID");
        }
        missing
    }

    /// Whether every required value is present
    pub fn is_complete(&self) -> bool {
        self.missing_values().is_empty()
    }

    /// Resolve the call target, failing if any required value is absent
    pub fn resolve(&self) -> Result<ListTarget> {
        let missing = self.missing_values();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Mailing-list configuration incomplete, missing: {}",
                missing.join(", ")
            )));
        }

        let value = |v: &Option<String>| v.as_deref().unwrap_or_default().trim().to_string();
        Ok(ListTarget::new(
            value(&self.api_key),
            value(&self.server_prefix),
            value(&self.list_id),
        ))
    }
}

/// Retry policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per external call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (in milliseconds), doubled after each retryable failure
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryConfig {
    /// Validate the retry settings
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("Retry max_attempts must be > 0"));
        }
        Ok(())
    }

    /// Build the runtime policy
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

/// Bulk backfill settings
#[derive(Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Records written per committed batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Shared secret required by the HTTP backfill entry point (never logged)
    #[serde(default)]
    pub secret: Option<String>,
}

impl std::fmt::Debug for BackfillConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillConfig")
            .field("batch_size", &self.batch_size)
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl BackfillConfig {
    /// Validate the backfill settings
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BACKFILL_BATCH_SIZE {
            return Err(Error::config(format!(
                "Backfill batch_size must be between 1 and {}",
                MAX_BACKFILL_BATCH_SIZE
            )));
        }
        Ok(())
    }

    /// Configured secret, treating an empty string as unset
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            secret: None,
        }
    }
}

fn default_batch_size() -> usize {
    200
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the monitoring event channel
    ///
    /// When full, new events are dropped (with a warning log) rather than
    /// blocking a sync.
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Serialize overlapping syncs for the same user
    ///
    /// Syncs for different users always run concurrently.
    #[serde(default = "default_serialize_per_user")]
    pub serialize_per_user: bool,
}

impl EngineConfig {
    /// Validate the engine settings
    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            return Err(Error::config("Engine event_channel_capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            serialize_per_user: default_serialize_per_user(),
        }
    }
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_serialize_per_user() -> bool {
    true
}
