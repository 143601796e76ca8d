//! Server error numbers this core emits or interprets

/// Generic failure forwarded to a client
pub const ER_YES: u16 = 1003;
/// Statement routed to no data node
pub const ER_NO_DB_ERROR: u16 = 1046;
/// Route names a data node that is not configured
pub const ER_BAD_DB_ERROR: u16 = 1049;
/// Backend is shutting down; reported by heartbeat probes as OFF
pub const ER_SERVER_SHUTDOWN: u16 = 1053;
