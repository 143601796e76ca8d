//! Data source liveness detection
//!
//! This module provides:
//! - A per-source heartbeat probe over a dedicated detector connection
//! - Consecutive failure accounting against a retry threshold
//! - Failover of the owning data node once the active source exhausts its retries

mod heartbeat;
mod state;

pub use heartbeat::Heartbeat;
pub use state::{HeartbeatStatus, SourceHealth, Verdict};
