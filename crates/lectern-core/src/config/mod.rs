//! Engine and remote endpoint configuration.
//!
//! `SyncConfig` carries the tuning knobs of the replication engine and
//! `RemoteConfig` the Supabase endpoint it talks to.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::Pace;
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const DEFAULT_PULL_PAGE_SIZE: usize = 50;
const DEFAULT_PUSH_BATCH_SIZE: usize = 50;
const DEFAULT_PUSH_CONCURRENCY: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TRIGGER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_DATE_WINDOW_DAYS: u32 = 14;
const DEFAULT_POSITION_BACK: u64 = 14;
const DEFAULT_POSITION_AHEAD: u64 = 30;
const DEFAULT_PAUSE_AFTER_FAILURES: u32 = 3;

/// Band of positions mirrored around the user's current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionBand {
    pub back: u64,
    pub ahead: u64,
}

impl Default for PositionBand {
    fn default() -> Self {
        Self {
            back: DEFAULT_POSITION_BACK,
            ahead: DEFAULT_POSITION_AHEAD,
        }
    }
}

/// Tuning for the replication engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows per pull page unless the collection overrides it
    pub pull_page_size: usize,
    /// Queue entries taken per push batch
    pub push_batch_size: usize,
    /// Documents pushed in parallel within a batch
    pub push_concurrency: usize,
    /// Bound on a single remote call
    pub request_timeout: Duration,
    /// Bound on a manual push-then-pull round
    pub trigger_timeout: Duration,
    /// Periodic pull interval; `None` disables the timer
    pub sync_interval: Option<Duration>,
    /// Half width of date windows, in days
    pub date_window_days: u32,
    /// Position band used when the pace has no override
    pub position_band: PositionBand,
    pub pace_bands: HashMap<Pace, PositionBand>,
    /// Consecutive transient failures before a collection pauses
    pub pause_after_failures: u32,
    /// Backoff used while a collection is initializing
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Set the default pull page size
    #[must_use]
    pub const fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Set the push batch size
    #[must_use]
    pub const fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Set how many documents are pushed in parallel
    #[must_use]
    pub const fn with_push_concurrency(mut self, concurrency: usize) -> Self {
        self.push_concurrency = concurrency;
        self
    }

    /// Set the per-request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the manual sync timeout
    #[must_use]
    pub const fn with_trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    /// Set the periodic sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable the periodic timer (signals and manual triggers only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Override the position band for one pace
    #[must_use]
    pub fn with_pace_band(mut self, pace: Pace, band: PositionBand) -> Self {
        self.pace_bands.insert(pace, band);
        self
    }

    #[must_use]
    pub const fn with_pause_after_failures(mut self, failures: u32) -> Self {
        self.pause_after_failures = failures;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Position band for a pace.
    pub fn band_for(&self, pace: Pace) -> PositionBand {
        self.pace_bands
            .get(&pace)
            .copied()
            .unwrap_or(self.position_band)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_page_size: DEFAULT_PULL_PAGE_SIZE,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            push_concurrency: DEFAULT_PUSH_CONCURRENCY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            trigger_timeout: Duration::from_secs(DEFAULT_TRIGGER_TIMEOUT_SECS),
            sync_interval: Some(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)),
            date_window_days: DEFAULT_DATE_WINDOW_DAYS,
            position_band: PositionBand::default(),
            pace_bands: HashMap::new(),
            pause_after_failures: DEFAULT_PAUSE_AFTER_FAILURES,
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff between initializing pull attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// No waiting between attempts (tests).
    pub const fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the given attempt (0-indexed; the first attempt never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Supabase endpoint and credentials for the remote store.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub supabase_url: String,
    pub anon_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("supabase_url", &self.supabase_url)
            .field("anon_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(supabase_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            supabase_url: supabase_url.into(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = normalize_text_option(Some(token.into()));
        self
    }

    /// Validate and normalize the endpoint values.
    pub fn validated(self) -> Result<Self> {
        let supabase_url = normalize_text_option(Some(self.supabase_url))
            .ok_or_else(|| Error::InvalidInput("supabase_url must not be empty".to_string()))?;
        if !is_http_url(&supabase_url) {
            return Err(Error::InvalidInput(
                "supabase_url must include http:// or https://".to_string(),
            ));
        }
        let anon_key = normalize_text_option(Some(self.anon_key))
            .ok_or_else(|| Error::InvalidInput("anon_key must not be empty".to_string()))?;
        Ok(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            anon_key,
            access_token: normalize_text_option(self.access_token),
        })
    }

    /// Base URL of the PostgREST API.
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.supabase_url.trim_end_matches('/'))
    }
}
