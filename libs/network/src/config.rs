//! Core Configuration Types
//!
//! Configuration for endpoint pools, retries and the configuration
//! refresher. Everything is validated up front; core logic never reads
//! ambient process state.

use crate::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the refresher abandons the terse streaming endpoint for the verbose
/// one. The exact trigger is deployment-dependent, so it is a policy knob
/// rather than hard-coded behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FallbackPolicy {
    /// Any terse failure before the first payload switches to verbose
    #[default]
    OnAnyError,
    /// Only unparseable terse payloads switch; connect errors keep retrying terse
    OnParseError,
    /// Never fall back; terse is retried forever
    Never,
}

/// Retry configuration for transient dispatch failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Whether to use exponential backoff
    pub use_exponential_backoff: bool,
    /// Add up to 50% random jitter to each delay
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 60, // 60x base delay max
            use_exponential_backoff: true,
            jitter: false,
        }
    }

    /// Calculate delay for given attempt number
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = if self.use_exponential_backoff {
            let delay = self.base_delay_ms.saturating_mul(2_u64.pow(attempt.min(10)));
            delay.min(self.max_delay_ms)
        } else {
            self.base_delay_ms
        };
        let ms = if self.jitter {
            use rand::Rng;
            let spread = base / 2;
            base + rand::thread_rng().gen_range(0..=spread.max(1))
        } else {
            base
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, 100) // 3 attempts, 100ms base delay
    }
}

/// Configuration for the background config refresher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherConfig {
    /// Terse-to-verbose fallback trigger
    pub fallback: FallbackPolicy,
    /// Polling interval when no streaming source is available
    pub poll_interval: Duration,
    /// Backoff between stream reconnect attempts
    pub reconnect: RetryConfig,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::default(),
            poll_interval: Duration::from_secs(10),
            reconnect: RetryConfig::new(u32::MAX, 250), // never give up on config
        }
    }
}

/// Top-level configuration of the client core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Fixed endpoint pool size per (node, service) pair
    pub endpoints_per_node: usize,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Outbound request queue depth per endpoint; a full queue is the
    /// backpressure signal that pauses senders
    pub request_queue_depth: usize,
    /// Maximum response body accepted from the wire
    pub max_frame_body: usize,
    /// Use TLS service ports from the topology
    pub tls: bool,
    /// Retry policy for transient dispatch failures
    pub retry: RetryConfig,
}

impl CoreConfig {
    pub fn new() -> Self {
        Self {
            endpoints_per_node: 1,
            connect_timeout: Duration::from_secs(5),
            request_queue_depth: 1024,
            max_frame_body: 16 * 1024 * 1024, // 16MB
            tls: false,
            retry: RetryConfig::default(),
        }
    }

    /// Set the endpoint pool size per (node, service) pair
    pub fn with_endpoints_per_node(mut self, count: usize) -> Self {
        self.endpoints_per_node = count;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoints_per_node == 0 {
            return Err(ClientError::config(
                "endpoints_per_node cannot be zero",
                Some("endpoints_per_node"),
            ));
        }
        if self.request_queue_depth == 0 {
            return Err(ClientError::config(
                "request_queue_depth cannot be zero",
                Some("request_queue_depth"),
            ));
        }
        if self.max_frame_body == 0 {
            return Err(ClientError::config(
                "max_frame_body cannot be zero",
                Some("max_frame_body"),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClientError::config(
                "retry max_attempts cannot be zero",
                Some("retry.max_attempts"),
            ));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let config = RetryConfig::new(5, 50);
        assert_eq!(config.calculate_delay(0), Duration::from_millis(50));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(200));
        // 2^10 * 50 would be 51_200; capped at 60x base.
        assert_eq!(config.calculate_delay(20), Duration::from_millis(3000));

        let flat = RetryConfig {
            use_exponential_backoff: false,
            ..config
        };
        assert_eq!(flat.calculate_delay(9), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_bounded() {
        let config = RetryConfig {
            jitter: true,
            ..RetryConfig::new(3, 100)
        };
        for attempt in 0..4 {
            let base = 100u64 * 2u64.pow(attempt);
            let delay = config.calculate_delay(attempt).as_millis() as u64;
            assert!(delay >= base.min(6000));
            assert!(delay <= base.min(6000) * 3 / 2 + 1);
        }
    }

    #[test]
    fn zero_pool_size_rejected() {
        let config = CoreConfig::new().with_endpoints_per_node(0);
        assert!(config.validate().is_err());
        assert!(CoreConfig::default().validate().is_ok());
    }
}
