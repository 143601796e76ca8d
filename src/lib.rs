//! Backend execution core of a MySQL sharding middleware.
//!
//! Routed statements are dispatched over pooled backend connections, their responses are
//! reassembled and streamed back to the client, and each shard keeps one healthy active
//! data source through heartbeat-driven failover.

pub mod config;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod session;
