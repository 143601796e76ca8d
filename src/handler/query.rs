use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::metrics::metrics;
use crate::pool::{BackendConnection, ConnectionError};
use crate::protocol::error_code::{ER_BAD_DB_ERROR, ER_YES};
use crate::protocol::response::SERVER_STATUS_AUTOCOMMIT;
use crate::protocol::{write_frame, ErrPacket, OkPacket};
use crate::session::{write_error, write_ok, write_packet, Session, ShardTarget};

use super::{Callback, NodeCounter, ResponseHandler, Terminatable};

/// Output state shared by all branches; writes to the client happen under its lock
#[derive(Default)]
struct QueryState {
    packet_id: u8,
    fields_sent: bool,
    affected_rows: u64,
    /// Smallest non-zero insert id reported by any shard
    insert_id: u64,
    /// Terminating EOF of the result set, if the statement produced one
    last_eof: Option<Bytes>,
}

impl QueryState {
    fn next_id(&mut self) -> u8 {
        self.packet_id = self.packet_id.wrapping_add(1);
        self.packet_id
    }
}

/// Runs one statement on several shards at once.
///
/// Result sets are merged by forwarding the first shard's column definitions and every
/// shard's rows; OK results are summed. The client sees one terminal packet once every
/// shard has reported, an error if any shard failed.
pub struct MultiNodeQueryHandler {
    targets: Vec<ShardTarget>,
    autocommit: bool,
    session: Arc<Session>,
    counter: NodeCounter,
    state: Mutex<QueryState>,
    me: Weak<MultiNodeQueryHandler>,
}

impl MultiNodeQueryHandler {
    pub fn new(targets: Vec<ShardTarget>, autocommit: bool, session: Arc<Session>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            targets,
            autocommit,
            session,
            counter: NodeCounter::new(),
            state: Mutex::new(QueryState::default()),
            me: me.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.counter.is_running()
    }

    pub fn execute(&self) {
        *self.state.lock() = QueryState::default();
        self.counter.reset(self.targets.len());
        metrics().record_statement("multi");

        let Some(me) = self.me.upgrade() else {
            return;
        };
        for target in &self.targets {
            if let Some(conn) = self.session.bound_connection(target) {
                if !conn.is_closed() {
                    conn.set_running(true);
                    let me = Arc::clone(&me);
                    let target = target.clone();
                    tokio::spawn(async move {
                        me.run_on(conn, &target);
                    });
                    continue;
                }
                self.session.unbind_connection(target);
            }

            let acquired = match self.session.pools().node(&target.name) {
                Some(node) => node.get_connection(
                    Arc::clone(&me) as Arc<dyn ResponseHandler>,
                    Some(target.clone()),
                ),
                None => {
                    self.counter
                        .set_failed(ER_BAD_DB_ERROR, format!("Unknown dataNode '{}'", target.name));
                    Err(ConnectionError::UnknownNode(target.name.clone()))
                }
            };
            if let Err(e) = acquired {
                self.connection_error(e, None);
            }
        }
    }

    fn run_on(self: &Arc<Self>, conn: Arc<BackendConnection>, target: &ShardTarget) {
        if self.session.is_closed() {
            conn.set_running(false);
            self.branch_done(Some(&conn));
            return;
        }
        conn.set_handler(Arc::clone(self) as Arc<dyn ResponseHandler>);

        let charset = self.session.frontend().charset();
        match conn.execute(&target.statement, &charset, self.autocommit) {
            Ok(()) => {}
            Err(ConnectionError::UnsupportedCharset(name)) => {
                conn.set_running(false);
                self.counter
                    .set_failed(ER_YES, format!("unknown backend charset: {}", name));
                self.branch_done(Some(&conn));
            }
            Err(e) => self.connection_error(e, Some(&conn)),
        }
    }

    /// Count one branch; the caller that brings the count to zero finalizes
    fn branch_done(&self, conn: Option<&Arc<BackendConnection>>) {
        let zero = match conn {
            Some(conn) => self.counter.decrement_once(conn.id()),
            None => self.counter.decrement(),
        };
        if zero {
            self.finalize();
            self.counter.finished();
        }
    }

    fn finalize(&self) {
        let front = self.session.frontend();
        let mut state = self.state.lock();

        if self.counter.is_failed() || self.session.is_closed() {
            metrics().record_statement_error("multi");
            self.session.clear_connections(true);
            let (code, message) = self
                .counter
                .first_error()
                .unwrap_or_else(|| (ER_YES, "session closed".to_string()));
            write_error(front.as_ref(), state.next_id(), code, &message);
            return;
        }

        if let Some(eof) = state.last_eof.take() {
            if self.autocommit {
                self.session.release_connections();
            }
            let id = state.next_id();
            write_packet(front.as_ref(), id, &eof);
            return;
        }

        let ok = OkPacket {
            affected_rows: state.affected_rows,
            last_insert_id: state.insert_id,
            status_flags: if front.is_autocommit() {
                SERVER_STATUS_AUTOCOMMIT
            } else {
                0
            },
            ..OkPacket::default()
        };
        front.set_last_insert_id(ok.last_insert_id);

        if self.autocommit {
            self.session.release_connections();
            write_ok(front.as_ref(), state.next_id(), &ok);
        } else if front.is_autocommit() {
            // Write under client autocommit: commit all shards, answer with the merged OK
            drop(state);
            self.session.commit_with(Some(ok));
        } else {
            write_ok(front.as_ref(), state.next_id(), &ok);
        }
    }
}

impl ResponseHandler for MultiNodeQueryHandler {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        let Some(target) = conn.attachment() else {
            conn.release();
            self.counter.set_failed(ER_YES, "connection acquired without a target");
            self.branch_done(None);
            return;
        };
        let Some(me) = self.me.upgrade() else {
            conn.release();
            return;
        };
        conn.set_running(true);
        self.session.bind_connection(target.clone(), Arc::clone(&conn));
        tokio::spawn(async move {
            me.run_on(conn, &target);
        });
    }

    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>) {
        debug!(error = %err, "Multi node connection error");
        if let Some(conn) = conn {
            conn.set_running(false);
            if let Some(target) = conn.attachment() {
                self.session.close_connection(&target);
            }
            conn.close("connection error");
        }
        self.counter.set_failed(ER_YES, err.to_string());
        self.branch_done(conn);
    }

    fn ok_packet(&self, ok: Bytes, conn: &Arc<BackendConnection>) {
        match conn.advance_status_sync() {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                self.connection_error(e, Some(conn));
                return;
            }
        }
        conn.set_running(false);
        if let Some(parsed) = OkPacket::parse(&ok) {
            let mut state = self.state.lock();
            state.affected_rows += parsed.affected_rows;
            if parsed.last_insert_id != 0
                && (state.insert_id == 0 || parsed.last_insert_id < state.insert_id)
            {
                state.insert_id = parsed.last_insert_id;
            }
        }
        self.branch_done(Some(conn));
    }

    fn error_packet(&self, err: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        let (code, message) = ErrPacket::parse(&err)
            .map(|e| (e.error_code, e.error_message))
            .unwrap_or((ER_YES, "unknown backend error".to_string()));
        self.counter.set_failed(code, message);
        self.branch_done(Some(conn));
    }

    fn fields_end(&self, header: Bytes, fields: Vec<Bytes>, eof: Bytes, _conn: &Arc<BackendConnection>) {
        if self.counter.is_failed() {
            return;
        }
        let mut state = self.state.lock();
        if state.fields_sent {
            return;
        }
        state.fields_sent = true;

        let mut buf = BytesMut::with_capacity(
            header.len() + eof.len() + fields.iter().map(Bytes::len).sum::<usize>() + 64,
        );
        write_frame(&mut buf, state.next_id(), &header);
        for field in &fields {
            write_frame(&mut buf, state.next_id(), field);
        }
        write_frame(&mut buf, state.next_id(), &eof);
        self.session.frontend().write(buf);
    }

    fn row_acquired(&self, row: Bytes, _conn: &Arc<BackendConnection>) {
        if self.counter.is_failed() {
            return;
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        write_packet(self.session.frontend().as_ref(), id, &row);
    }

    fn row_end(&self, eof: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        self.state.lock().last_eof = Some(eof);
        self.branch_done(Some(conn));
    }
}

impl Terminatable for MultiNodeQueryHandler {
    fn terminate(&self, callback: Callback) {
        self.counter.terminate(callback);
    }
}
