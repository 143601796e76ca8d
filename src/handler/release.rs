use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::pool::{BackendConnection, ConnectionError};

use super::ResponseHandler;

/// Owns a connection while a cleanup `ROLLBACK` runs, then returns it to the pool.
///
/// Anything but a clean OK means the backend transaction state is unknown, so the connection
/// is quit instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollbackReleaseHandler;

impl ResponseHandler for RollbackReleaseHandler {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        conn.release();
    }

    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>) {
        if let Some(conn) = conn {
            warn!(conn = %conn, error = %err, "Rollback before release failed");
            conn.close("rollback failed");
        }
    }

    fn ok_packet(&self, _ok: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        conn.release();
    }

    fn error_packet(&self, _err: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        conn.quit();
    }

    fn fields_end(&self, _header: Bytes, _fields: Vec<Bytes>, _eof: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_acquired(&self, _row: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_end(&self, _eof: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        conn.quit();
    }
}
