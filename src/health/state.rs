//! Heartbeat result accounting for one data source.
//!
//! Consecutive failed probes are counted; once the count exceeds the configured retry
//! threshold the source is considered failed and the owning node should switch away from it.

use std::time::{Duration, Instant};

/// Outcome of the most recent probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatStatus {
    /// No probe has completed since start
    #[default]
    Init,
    Ok,
    Error,
    /// Backend reported it is shutting down
    Off,
    /// Probe outstanding past the heartbeat timeout
    Timeout,
}

impl HeartbeatStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HeartbeatStatus::Init => "init",
            HeartbeatStatus::Ok => "ok",
            HeartbeatStatus::Error => "error",
            HeartbeatStatus::Off => "off",
            HeartbeatStatus::Timeout => "timeout",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            HeartbeatStatus::Error | HeartbeatStatus::Off | HeartbeatStatus::Timeout
        )
    }
}

/// What the owner should do after a result was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Failing, but still within the retry budget
    Suspect,
    /// Retry budget exhausted
    Failed,
}

#[derive(Debug, Default)]
pub struct SourceHealth {
    pub status: HeartbeatStatus,
    /// Consecutive failed probes
    pub error_count: u32,
    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
}

impl SourceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe outcome against a retry threshold
    pub fn record(&mut self, result: HeartbeatStatus, retry: u32) -> Verdict {
        let now = Instant::now();
        self.last_check = Some(now);
        self.status = result;

        if !result.is_failure() {
            self.error_count = 0;
            self.last_success = Some(now);
            return Verdict::Healthy;
        }

        self.error_count = self.error_count.saturating_add(1);
        if self.error_count > retry {
            Verdict::Failed
        } else {
            Verdict::Suspect
        }
    }

    /// Back to the freshly started state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn time_since_last_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }
}
