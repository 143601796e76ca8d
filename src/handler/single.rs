use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metrics::metrics;
use crate::pool::{BackendConnection, ConnectionError};
use crate::protocol::error_code::{ER_BAD_DB_ERROR, ER_YES};
use crate::protocol::{write_frame, OkPacket};
use crate::session::{write_error, write_packet, Session, ShardTarget};

use super::{Callback, ResponseHandler, Terminatable};

#[derive(Default)]
struct RunState {
    running: bool,
    terminate: Option<Callback>,
}

/// Runs one statement on one shard and streams the response to the client.
///
/// Every packet written to the client is renumbered from 1 and flushed as soon as the
/// corresponding backend event arrives.
pub struct SingleNodeHandler {
    target: ShardTarget,
    session: Arc<Session>,
    state: Mutex<RunState>,
    packet_id: AtomicU8,
    me: Weak<SingleNodeHandler>,
}

impl SingleNodeHandler {
    pub fn new(target: ShardTarget, session: Arc<Session>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            target,
            session,
            state: Mutex::new(RunState::default()),
            packet_id: AtomicU8::new(0),
            me: me.clone(),
        })
    }

    pub fn target(&self) -> &ShardTarget {
        &self.target
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn execute(&self) {
        self.state.lock().running = true;
        self.packet_id.store(0, Ordering::Release);
        metrics().record_statement("single");

        if let Some(conn) = self.session.bound_connection(&self.target) {
            if !conn.is_closed() {
                conn.set_running(true);
                self.spawn_run(conn);
                return;
            }
            self.session.unbind_connection(&self.target);
        }

        let Some(node) = self.session.pools().node(&self.target.name) else {
            self.fail(ER_BAD_DB_ERROR, &format!("Unknown dataNode '{}'", self.target.name));
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if let Err(e) = node.get_connection(me, Some(self.target.clone())) {
            self.connection_error(e, None);
        }
    }

    fn spawn_run(&self, conn: Arc<BackendConnection>) {
        let Some(me) = self.me.upgrade() else {
            conn.set_running(false);
            return;
        };
        tokio::spawn(async move {
            me.run_on(conn);
        });
    }

    fn run_on(self: &Arc<Self>, conn: Arc<BackendConnection>) {
        if self.session.is_closed() {
            conn.set_running(false);
            self.finish(|| {});
            self.session.clear_connections(true);
            return;
        }
        conn.set_handler(Arc::clone(self) as Arc<dyn ResponseHandler>);

        let front = self.session.frontend();
        match conn.execute(&self.target.statement, &front.charset(), front.is_autocommit()) {
            Ok(()) => {}
            Err(ConnectionError::UnsupportedCharset(_)) => self.execute_exception(&conn),
            Err(e) => self.connection_error(e, Some(&conn)),
        }
    }

    fn next_id(&self) -> u8 {
        self.packet_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Leave the running state and, only if this call did so, write the terminal response.
    /// A terminate callback parked meanwhile runs last.
    fn finish(&self, respond: impl FnOnce()) {
        let callback = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.terminate.take()
        };
        respond();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn fail(&self, code: u16, message: &str) {
        metrics().record_statement_error("single");
        self.finish(|| {
            write_error(self.session.frontend().as_ref(), self.next_id(), code, message);
        });
    }

    fn execute_exception(&self, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        self.session.clear_connections(true);
        self.fail(ER_YES, &format!("unknown backend charset: {}", conn.charset()));
    }
}

impl ResponseHandler for SingleNodeHandler {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        conn.set_running(true);
        self.session.bind_connection(self.target.clone(), Arc::clone(&conn));
        self.spawn_run(conn);
    }

    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>) {
        debug!(node = %self.target.name, error = %err, "Single node connection error");
        if !self.session.close_connection(&self.target) {
            if let Some(conn) = conn {
                conn.close("connection error");
            }
        }
        self.fail(ER_YES, &err.to_string());
    }

    fn ok_packet(&self, ok: Bytes, conn: &Arc<BackendConnection>) {
        match conn.advance_status_sync() {
            Ok(true) => return,
            Ok(false) => {}
            Err(ConnectionError::UnsupportedCharset(_)) => {
                self.execute_exception(conn);
                return;
            }
            Err(e) => {
                self.connection_error(e, Some(conn));
                return;
            }
        }

        conn.set_running(false);
        let front = self.session.frontend();
        conn.record_sql(&front.host(), front.schema().as_deref(), &self.target.statement);
        if front.is_autocommit() {
            self.session.clear_connections(true);
        }
        self.finish(|| {
            if let Some(parsed) = OkPacket::parse(&ok) {
                front.set_last_insert_id(parsed.last_insert_id);
            }
            write_packet(front.as_ref(), self.next_id(), &ok);
        });
    }

    fn error_packet(&self, err: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        if conn.is_autocommit() {
            self.session.clear_connections(true);
        }
        metrics().record_statement_error("single");
        self.finish(|| {
            write_packet(self.session.frontend().as_ref(), self.next_id(), &err);
        });
    }

    fn fields_end(&self, header: Bytes, fields: Vec<Bytes>, eof: Bytes, _conn: &Arc<BackendConnection>) {
        let size = header.len() + eof.len() + fields.iter().map(Bytes::len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(size + 4 * (fields.len() + 2));
        write_frame(&mut buf, self.next_id(), &header);
        for field in &fields {
            write_frame(&mut buf, self.next_id(), field);
        }
        write_frame(&mut buf, self.next_id(), &eof);
        self.session.frontend().write(buf);
    }

    fn row_acquired(&self, row: Bytes, _conn: &Arc<BackendConnection>) {
        write_packet(self.session.frontend().as_ref(), self.next_id(), &row);
    }

    fn row_end(&self, eof: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        let front = self.session.frontend();
        conn.record_sql(&front.host(), front.schema().as_deref(), &self.target.statement);
        if front.is_autocommit() {
            self.session.clear_connections(true);
        }
        self.finish(|| {
            write_packet(front.as_ref(), self.next_id(), &eof);
        });
    }
}

impl Terminatable for SingleNodeHandler {
    fn terminate(&self, callback: Callback) {
        {
            let mut state = self.state.lock();
            if state.running {
                state.terminate = Some(callback);
                return;
            }
        }
        callback();
    }
}

impl Drop for SingleNodeHandler {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.running {
            warn!(node = %self.target.name, "Single node handler dropped while running");
        }
        if let Some(callback) = state.terminate.take() {
            callback();
        }
    }
}
