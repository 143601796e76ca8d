use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::pool::{BackendConnection, ConnectionError};
use crate::protocol::{command, ErrPacket};

use super::{Callback, ResponseHandler};

/// Fires its hook once every kill has finished
pub struct KillLatch {
    remaining: AtomicUsize,
    hook: Mutex<Option<Callback>>,
}

impl KillLatch {
    pub fn new(count: usize, hook: Callback) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            hook: Mutex::new(Some(hook)),
        })
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn finished(&self) {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }
}

/// Sends `KILL <thread id>` for a running connection over a second pooled connection.
///
/// Whatever the outcome, the killed connection is closed and the latch counted down.
pub struct KillConnectionHandler {
    killee: Arc<BackendConnection>,
    latch: Arc<KillLatch>,
    finished: AtomicBool,
    me: Weak<KillConnectionHandler>,
}

impl KillConnectionHandler {
    pub fn new(killee: Arc<BackendConnection>, latch: Arc<KillLatch>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            killee,
            latch,
            finished: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    fn done(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.killee.close("killed");
        self.latch.finished();
    }
}

impl ResponseHandler for KillConnectionHandler {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        let Some(me) = self.me.upgrade() else {
            conn.release();
            return;
        };
        conn.set_handler(me);
        conn.set_running(true);
        if let Err(e) = conn.write(command::kill(self.killee.thread_id())) {
            self.connection_error(e, Some(&conn));
        }
    }

    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>) {
        warn!(killee = %self.killee, error = %err, "Kill connection failed");
        if let Some(conn) = conn {
            conn.close("kill failed");
        }
        self.done();
    }

    fn ok_packet(&self, _ok: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        conn.release();
        self.done();
    }

    fn error_packet(&self, err: Bytes, conn: &Arc<BackendConnection>) {
        let message = ErrPacket::parse(&err)
            .map(|e| e.error_message)
            .unwrap_or_default();
        warn!(killee = %self.killee, error = %message, "Kill backend connection failed");
        conn.set_running(false);
        conn.release();
        self.done();
    }

    fn fields_end(&self, _header: Bytes, _fields: Vec<Bytes>, _eof: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_acquired(&self, _row: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_end(&self, _eof: Bytes, conn: &Arc<BackendConnection>) {
        error!(conn = %conn, killee = %self.killee, "Unexpected result set in reply to KILL");
        conn.set_running(false);
        conn.quit();
        self.done();
    }
}
