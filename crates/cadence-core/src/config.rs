//! Configuration for the EME and segment fetching subsystems

use crate::manifest::AdaptationType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, doubled on each new attempt
    pub base_delay: Duration,
    /// Upper bound of a single delay
    pub max_delay: Duration,
}

impl BackoffConfig {
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait before the `retry_count`-th retry (starting at 1)
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retry policy used when closing a session the CDM has not initialized yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosingConfig {
    pub max_retry: u32,
    pub backoff: BackoffConfig,
}

impl Default for SessionClosingConfig {
    fn default() -> Self {
        Self {
            max_retry: 5,
            backoff: BackoffConfig::new(Duration::from_millis(100), Duration::from_millis(1000)),
        }
    }
}

/// EME configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmeConfig {
    /// Maximum number of sessions kept alive on a single MediaKeys instance
    pub max_simultaneous_sessions: usize,
    /// Maximum number of persisted session records kept in license storage
    pub max_stored_persistent_sessions: usize,
    /// Safe-close retry policy
    pub session_closing: SessionClosingConfig,
    /// Delays between license request attempts
    pub license_backoff: BackoffConfig,
    /// Number of license request retries when the key system does not say
    pub default_license_retry: u32,
    /// License request timeout when the key system does not say
    pub default_license_timeout: Duration,
}

impl Default for EmeConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_sessions: 15,
            max_stored_persistent_sessions: 1000,
            session_closing: SessionClosingConfig::default(),
            license_backoff: BackoffConfig::new(
                Duration::from_millis(200),
                Duration::from_millis(3000),
            ),
            default_license_retry: 2,
            default_license_timeout: Duration::from_secs(10),
        }
    }
}

/// Priority steps of the task prioritizer.
///
/// Lower number means higher priority. Starting a task whose priority is
/// `<= high` interrupts every running task whose priority is `>= low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioritizerConfig {
    pub high: i32,
    pub low: i32,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self { high: 1, low: 3 }
    }
}

/// User-facing options of the segment request scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRequestOptions {
    /// Low-latency contents use shorter backoff delays
    pub low_latency_mode: bool,
    /// Retries on a regular error, `None` for the default
    pub max_retry_regular: Option<u32>,
    /// Retries while offline, `None` for the default (unbounded)
    pub max_retry_offline: Option<u32>,
}

/// Backoff options applied to a segment request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBackoffOptions {
    pub backoff: BackoffConfig,
    pub max_retry_regular: u32,
    pub max_retry_offline: u32,
}

impl SegmentBackoffOptions {
    pub const DEFAULT_MAX_RETRY_REGULAR: u32 = 4;

    /// Derive the backoff options for a given type of buffer
    pub fn for_buffer(kind: AdaptationType, options: &SegmentRequestOptions) -> Self {
        let backoff = if options.low_latency_mode {
            BackoffConfig::new(Duration::from_millis(50), Duration::from_millis(1000))
        } else {
            BackoffConfig::new(Duration::from_millis(200), Duration::from_millis(3000))
        };

        // Text and image tracks are not worth waiting for while offline
        let max_retry_offline = match kind {
            AdaptationType::Text | AdaptationType::Image => 0,
            AdaptationType::Audio | AdaptationType::Video => {
                options.max_retry_offline.unwrap_or(u32::MAX)
            }
        };

        Self {
            backoff,
            max_retry_regular: options
                .max_retry_regular
                .unwrap_or(Self::DEFAULT_MAX_RETRY_REGULAR),
            max_retry_offline,
        }
    }
}

impl Default for SegmentBackoffOptions {
    fn default() -> Self {
        Self::for_buffer(AdaptationType::Video, &SegmentRequestOptions::default())
    }
}
