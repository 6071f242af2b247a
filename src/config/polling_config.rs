use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling schedule, timeouts and retry budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Time between poll cycles in continuous mode.
    pub interval_seconds: u64,
    /// Budget for connect + pair + poke + response of one poll.
    pub poll_timeout_seconds: u64,
    /// Wait for a single response before re-issuing the request.
    pub response_timeout_seconds: u64,
    /// In-session re-sends after a garbled or missing response.
    pub max_frame_retries: u32,
    /// Orchestrator-level attempts per device and cycle.
    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
    /// Concurrent sessions on the adapter.
    pub max_concurrent: usize,
    /// Cap for the per-device backoff after repeated failures.
    pub max_backoff_seconds: u64,
    /// Pause after each poll to let the radio settle.
    pub inter_poll_delay_seconds: u64,
    /// Usable bytes per characteristic write.
    pub mtu: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval_seconds: 900,
            poll_timeout_seconds: 60,
            response_timeout_seconds: 10,
            max_frame_retries: 2,
            retry_attempts: 3,
            retry_delay_seconds: 30,
            max_concurrent: 1,
            max_backoff_seconds: 3600,
            inter_poll_delay_seconds: 2,
            mtu: crate::core::protocol::DEFAULT_MTU,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn inter_poll_delay(&self) -> Duration {
        Duration::from_secs(self.inter_poll_delay_seconds)
    }
}
