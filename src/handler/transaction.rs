use std::collections::HashSet;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::metrics::metrics;
use crate::pool::{BackendConnection, ConnectionError};
use crate::protocol::error_code::ER_YES;
use crate::protocol::{ErrPacket, OkPacket};
use crate::session::{write_error, write_ok, write_packet, Session};

use super::{Callback, NodeCounter, ResponseHandler, Terminatable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Commit,
    Rollback,
}

impl TransactionKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Commit => "commit",
            TransactionKind::Rollback => "rollback",
        }
    }
}

/// Commits or rolls back every connection bound to a session.
///
/// After a successful rollback, connections that were outside autocommit when it started are
/// closed; the others go back to the pool.
///
/// A result set in reply to COMMIT/ROLLBACK is a protocol violation: the connection is
/// closed and counted as failed so the invocation still completes.
pub struct TransactionHandler {
    kind: TransactionKind,
    session: Arc<Session>,
    counter: NodeCounter,
    /// Answer to send instead of the backend's OK (implicit commit after a fan-out write)
    ok: Mutex<Option<OkPacket>>,
    last_ok: Mutex<Option<Bytes>>,
    /// Connections that had autocommit off when the invocation started
    non_autocommit: Mutex<HashSet<u64>>,
    me: Weak<TransactionHandler>,
}

impl TransactionHandler {
    pub fn new(kind: TransactionKind, session: Arc<Session>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            kind,
            session,
            counter: NodeCounter::new(),
            ok: Mutex::new(None),
            last_ok: Mutex::new(None),
            non_autocommit: Mutex::new(HashSet::new()),
            me: me.clone(),
        })
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.counter.is_running()
    }

    pub fn run(&self, ok: Option<OkPacket>) {
        let targets = self.session.bound_targets();
        let init_count = targets.len();
        self.counter.reset(init_count);
        *self.ok.lock() = ok;
        *self.last_ok.lock() = None;
        self.non_autocommit.lock().clear();
        metrics().record_statement(self.kind.label());

        if self.session.is_closed() {
            if self.counter.decrement_by(init_count) {
                self.complete();
            }
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let mut started = 0;
        for target in targets {
            let Some(conn) = self.session.bound_connection(&target) else {
                continue;
            };
            if !conn.is_autocommit() {
                self.non_autocommit.lock().insert(conn.id());
            }
            conn.set_running(true);
            let me = Arc::clone(&me);
            tokio::spawn(async move {
                if me.counter.is_failed() || me.session.is_closed() {
                    me.backend_error(Some(&conn), ER_YES, "cancelled by other thread".to_string());
                    return;
                }
                conn.set_handler(Arc::clone(&me) as Arc<dyn ResponseHandler>);
                let sent = match me.kind {
                    TransactionKind::Commit => conn.commit(),
                    TransactionKind::Rollback => conn.rollback(),
                };
                if let Err(e) = sent {
                    me.backend_error(Some(&conn), ER_YES, e.to_string());
                }
            });
            started += 1;
        }

        // Bindings removed since the snapshot count as done
        if started < init_count && self.counter.decrement_by(init_count - started) {
            self.complete();
        }
    }

    fn backend_error(&self, conn: Option<&Arc<BackendConnection>>, code: u16, message: String) {
        if let Some(conn) = conn {
            conn.set_running(false);
        }
        self.counter.set_failed(code, message);
        self.branch_done(conn);
    }

    fn branch_done(&self, conn: Option<&Arc<BackendConnection>>) {
        let zero = match conn {
            Some(conn) => self.counter.decrement_once(conn.id()),
            None => self.counter.decrement(),
        };
        if zero {
            self.complete();
        }
    }

    fn complete(&self) {
        self.finalize();
        self.counter.finished();
    }

    fn finalize(&self) {
        let front = self.session.frontend();
        if self.counter.is_failed() || self.session.is_closed() {
            metrics().record_statement_error(self.kind.label());
            self.session.clear_connections(true);
            let (code, message) = self
                .counter
                .first_error()
                .unwrap_or_else(|| (ER_YES, "session closed".to_string()));
            write_error(front.as_ref(), 1, code, &message);
            return;
        }

        if self.kind == TransactionKind::Rollback {
            self.close_non_autocommit();
        }
        self.session.release_connections();
        match (self.ok.lock().take(), self.last_ok.lock().take()) {
            (Some(ok), _) => write_ok(front.as_ref(), 1, &ok),
            (None, Some(raw)) => write_packet(front.as_ref(), 1, &raw),
            (None, None) => write_ok(front.as_ref(), 1, &OkPacket::new()),
        }
    }

    fn close_non_autocommit(&self) {
        let ids = std::mem::take(&mut *self.non_autocommit.lock());
        for target in self.session.bound_targets() {
            let closing = self
                .session
                .bound_connection(&target)
                .is_some_and(|conn| ids.contains(&conn.id()));
            if closing {
                self.session.close_connection(&target);
            }
        }
    }

    fn violation(&self, conn: &Arc<BackendConnection>, what: &str) {
        error!(
            conn = %conn,
            session = self.session.id(),
            kind = self.kind.label(),
            "Unexpected {} in reply to {}", what, self.kind.label()
        );
        conn.clear_handler();
        conn.set_running(false);
        conn.close("protocol violation");
        self.backend_error(
            Some(conn),
            ER_YES,
            format!("Unknown response packet for back-end {}", self.kind.label()),
        );
    }
}

impl ResponseHandler for TransactionHandler {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        error!(conn = %conn, kind = self.kind.label(), "Unexpected connection acquired");
        conn.release();
    }

    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>) {
        warn!(error = %err, kind = self.kind.label(), "Backend connection failed");
        let message = match conn {
            Some(conn) => format!("connection err for {}: {}", conn, err),
            None => err.to_string(),
        };
        self.backend_error(conn, ER_YES, message);
    }

    fn ok_packet(&self, ok: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        *self.last_ok.lock() = Some(ok);
        self.branch_done(Some(conn));
    }

    fn error_packet(&self, err: Bytes, conn: &Arc<BackendConnection>) {
        let (code, message) = ErrPacket::parse(&err)
            .map(|e| (e.error_code, e.error_message))
            .unwrap_or((ER_YES, "unknown backend error".to_string()));
        self.backend_error(Some(conn), code, message);
    }

    fn fields_end(&self, _header: Bytes, _fields: Vec<Bytes>, _eof: Bytes, conn: &Arc<BackendConnection>) {
        self.violation(conn, "field definitions");
    }

    fn row_acquired(&self, _row: Bytes, conn: &Arc<BackendConnection>) {
        self.violation(conn, "row data");
    }

    fn row_end(&self, _eof: Bytes, conn: &Arc<BackendConnection>) {
        self.backend_error(
            Some(conn),
            ER_YES,
            format!("Unknown response packet for back-end {}", self.kind.label()),
        );
    }
}

impl Terminatable for TransactionHandler {
    fn terminate(&self, callback: Callback) {
        self.counter.terminate(callback);
    }
}
