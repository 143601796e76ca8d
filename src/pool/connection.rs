use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::handler::ResponseHandler;
use crate::metrics::metrics;
use crate::protocol::{charset, command, Packet, ResponseAssembler, ResponseEvent};
use crate::session::ShardTarget;

use super::recorder::SqlRecord;
use super::source::DataSource;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Sitting in the pool
    Idle = 0,
    /// Owned by a handler or bound to a session
    InUse = 1,
    /// Closed or quit; never reused
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Idle,
            1 => ConnectionState::InUse,
            _ => ConnectionState::Closed,
        }
    }
}

/// What the backend reported during the handshake
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// host:port of the backend
    pub addr: String,
    /// Backend thread id, used by `KILL`
    pub thread_id: u32,
    pub capabilities: u32,
    pub charset: String,
    pub autocommit: bool,
}

/// Pending `SET names .., autocommit=..` phase before the real statement
#[derive(Debug)]
struct StatusSync {
    charset: String,
    autocommit: bool,
    statement: String,
}

enum Inbound {
    Packet(Packet),
    Error(ConnectionError),
}

/// A live connection to one physical backend.
///
/// Inbound messages are queued and drained by at most one task at a time, so the owning
/// handler sees events for this connection strictly in order.
pub struct BackendConnection {
    id: u64,
    info: ConnectionInfo,
    state: AtomicU8,
    running: AtomicBool,
    autocommit: AtomicBool,
    charset: Mutex<String>,
    handler: RwLock<Option<Arc<dyn ResponseHandler>>>,
    attachment: Mutex<Option<ShardTarget>>,
    status_sync: Mutex<Option<StatusSync>>,
    assembler: Mutex<ResponseAssembler>,
    inbox: Mutex<VecDeque<Inbound>>,
    inbox_capacity: usize,
    draining: AtomicBool,
    writer: mpsc::UnboundedSender<Packet>,
    pool: Weak<DataSource>,
    last_active: Mutex<Instant>,
    started_at: Mutex<Option<Instant>>,
    shutdown: CancellationToken,
}

impl BackendConnection {
    /// Wrap an authenticated backend. Outbound packets go to `writer`.
    pub fn new(
        info: ConnectionInfo,
        writer: mpsc::UnboundedSender<Packet>,
        pool: Weak<DataSource>,
        inbox_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            autocommit: AtomicBool::new(info.autocommit),
            charset: Mutex::new(info.charset.clone()),
            info,
            state: AtomicU8::new(ConnectionState::Idle as u8),
            running: AtomicBool::new(false),
            handler: RwLock::new(None),
            attachment: Mutex::new(None),
            status_sync: Mutex::new(None),
            assembler: Mutex::new(ResponseAssembler::new()),
            inbox: Mutex::new(VecDeque::new()),
            inbox_capacity: inbox_capacity.max(1),
            draining: AtomicBool::new(false),
            writer,
            pool,
            last_active: Mutex::new(Instant::now()),
            started_at: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> u32 {
        self.info.thread_id
    }

    pub fn addr(&self) -> &str {
        &self.info.addr
    }

    pub fn capabilities(&self) -> u32 {
        self.info.capabilities
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }

    pub fn charset(&self) -> String {
        self.charset.lock().clone()
    }

    pub fn attachment(&self) -> Option<ShardTarget> {
        self.attachment.lock().clone()
    }

    pub fn set_attachment(&self, target: Option<ShardTarget>) {
        *self.attachment.lock() = target;
    }

    pub fn set_handler(&self, handler: Arc<dyn ResponseHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    /// Token cancelled when the connection closes; socket tasks stop on it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Idle -> InUse. Fails if the connection is already taken or closed.
    pub(crate) fn try_acquire(&self) -> bool {
        let acquired = self
            .state
            .compare_exchange(
                ConnectionState::Idle as u8,
                ConnectionState::InUse as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if acquired {
            *self.last_active.lock() = Instant::now();
        }
        acquired
    }

    /// Send a raw packet to the backend
    pub fn write(&self, packet: Packet) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(format!("{} already closed", self)));
        }
        self.writer
            .send(packet)
            .map_err(|_| ConnectionError::Disconnected)
    }

    fn send_query(&self, sql: &str, charset: &str) -> Result<(), ConnectionError> {
        let packet = command::query(sql, charset)
            .ok_or_else(|| ConnectionError::UnsupportedCharset(charset.to_string()))?;
        self.set_running(true);
        self.write(packet)
    }

    /// Run `statement` with the session variables the caller requires.
    ///
    /// When charset or autocommit differ from the connection's current values a
    /// `SET names .., autocommit=..` is sent first and the statement follows on its OK
    /// (see `advance_status_sync`).
    pub fn execute(&self, statement: &str, charset: &str, autocommit: bool) -> Result<(), ConnectionError> {
        if charset::encode(statement, charset).is_none() {
            return Err(ConnectionError::UnsupportedCharset(charset.to_string()));
        }
        *self.started_at.lock() = Some(Instant::now());

        let current = self.charset();
        if current.eq_ignore_ascii_case(charset) && self.is_autocommit() == autocommit {
            *self.status_sync.lock() = None;
            return self.send_query(statement, charset);
        }

        *self.status_sync.lock() = Some(StatusSync {
            charset: charset.to_string(),
            autocommit,
            statement: statement.to_string(),
        });
        self.send_query(&command::status_sync_sql(charset, autocommit), "ascii")
    }

    /// Called by a handler on OK.
    ///
    /// Returns `Ok(true)` if that OK closed the session-variable phase and the statement has
    /// now been sent, `Ok(false)` if the OK belongs to the statement itself.
    pub fn advance_status_sync(&self) -> Result<bool, ConnectionError> {
        let sync = match self.status_sync.lock().take() {
            Some(sync) => sync,
            None => return Ok(false),
        };
        *self.charset.lock() = sync.charset.clone();
        self.autocommit.store(sync.autocommit, Ordering::Release);
        self.send_query(&sync.statement, &sync.charset)?;
        Ok(true)
    }

    pub fn commit(&self) -> Result<(), ConnectionError> {
        self.send_query("commit", "ascii")
    }

    pub fn rollback(&self) -> Result<(), ConnectionError> {
        self.send_query("rollback", "ascii")
    }

    /// Record the statement that just completed if it was slow enough
    pub fn record_sql(&self, host: &str, schema: Option<&str>, statement: &str) {
        let started = match self.started_at.lock().take() {
            Some(t) => t,
            None => return,
        };
        if let Some(ds) = self.pool.upgrade() {
            let duration = started.elapsed();
            ds.recorder().record(SqlRecord {
                host: host.to_string(),
                schema: schema.map(str::to_string),
                data_node: ds.node_name().to_string(),
                statement: statement.to_string(),
                started_at: SystemTime::now() - duration,
                duration,
            });
        }
    }

    /// Return to the pool. No-op unless the connection is in use.
    pub fn release(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::InUse as u8,
                ConnectionState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.set_running(false);
        self.clear_handler();
        self.set_attachment(None);
        *self.status_sync.lock() = None;
        *self.started_at.lock() = None;
        self.assembler.lock().reset();
        *self.last_active.lock() = Instant::now();

        match self.pool.upgrade() {
            Some(ds) => ds.release_channel(Arc::clone(self)),
            None => self.close("pool dropped"),
        }
    }

    /// Send COM_QUIT, then close
    pub fn quit(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let _ = self.write(command::quit());
        self.close("quit");
    }

    /// Close the connection. Idempotent.
    ///
    /// A running connection reports `ConnectionError::Closed` to its handler as its last event.
    pub fn close(self: &Arc<Self>, reason: &str) {
        self.shutdown_with(ConnectionError::Closed(reason.to_string()));
    }

    /// Transport failure reported by the socket reader
    pub fn on_transport_error(self: &Arc<Self>, err: ConnectionError) {
        self.shutdown_with(err);
    }

    fn shutdown_with(self: &Arc<Self>, err: ConnectionError) {
        let prev = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if prev == ConnectionState::Closed as u8 {
            return;
        }
        debug!(conn = %self, reason = %err, "Backend connection closed");
        self.shutdown.cancel();
        if let Some(ds) = self.pool.upgrade() {
            ds.on_closed(self.id);
        }
        if self.is_running() {
            {
                let mut inbox = self.inbox.lock();
                inbox.clear();
                inbox.push_back(Inbound::Error(err));
            }
            self.schedule_drain();
        }
    }

    /// Queue one framed message from the backend
    pub fn handle(self: &Arc<Self>, packet: Packet) {
        if self.is_closed() {
            return;
        }
        let overflow = {
            let mut inbox = self.inbox.lock();
            if inbox.len() >= self.inbox_capacity {
                true
            } else {
                inbox.push_back(Inbound::Packet(packet));
                false
            }
        };
        if overflow {
            warn!(conn = %self, capacity = self.inbox_capacity, "Backend queue full");
            self.shutdown_with(ConnectionError::QueueFull(self.inbox_capacity));
            return;
        }
        self.schedule_drain();
    }

    fn schedule_drain(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let conn = Arc::clone(self);
            tokio::spawn(async move { conn.drain() });
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            loop {
                let next = self.inbox.lock().pop_front();
                match next {
                    Some(item) => self.dispatch(item),
                    None => break,
                }
            }
            self.draining.store(false, Ordering::Release);

            // Catch messages queued between the last pop and the flag reset
            if self.inbox.lock().is_empty()
                || self
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, item: Inbound) {
        match item {
            Inbound::Packet(packet) => {
                if self.is_closed() {
                    return;
                }
                let fed = self.assembler.lock().feed(packet.payload);
                match fed {
                    Ok(Some(event)) => self.deliver(event),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(conn = %self, error = %e, "Backend protocol violation");
                        self.shutdown_with(ConnectionError::Protocol(e.to_string()));
                    }
                }
            }
            Inbound::Error(err) => {
                self.assembler.lock().reset();
                let handler = self.handler.read().clone();
                match handler {
                    Some(h) => {
                        let result = catch_unwind(AssertUnwindSafe(|| h.connection_error(err, Some(self))));
                        if result.is_err() {
                            error!(conn = %self, "Response handler panicked in connection_error");
                        }
                    }
                    None => debug!(conn = %self, error = %err, "No handler for connection error"),
                }
            }
        }
    }

    fn deliver(self: &Arc<Self>, event: ResponseEvent) {
        metrics().record_backend_event(event.label());
        let handler = match self.handler.read().clone() {
            Some(h) => h,
            None => {
                debug!(conn = %self, event = event.label(), "No handler for backend event");
                return;
            }
        };

        let label = event.label();
        let result = catch_unwind(AssertUnwindSafe(|| match event {
            ResponseEvent::Ok(ok) => handler.ok_packet(ok, self),
            ResponseEvent::Error(err) => handler.error_packet(err, self),
            ResponseEvent::FieldsEnd { header, fields, eof } => {
                handler.fields_end(header, fields, eof, self)
            }
            ResponseEvent::Row(row) => handler.row_acquired(row, self),
            ResponseEvent::RowEnd(eof) => handler.row_end(eof, self),
        }));

        if result.is_err() {
            error!(conn = %self, event = label, "Response handler panicked");
            self.shutdown_with(ConnectionError::Protocol(format!(
                "handler failed on {} event",
                label
            )));
        }
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Display for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackendConnection[id={}, thread={}, addr={}]",
            self.id, self.info.thread_id, self.info.addr
        )
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("thread_id", &self.info.thread_id)
            .field("addr", &self.info.addr)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Connection errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Backend queue overflow after {0} messages")]
    QueueFull(usize),

    #[error("unknown backend charset: {0}")]
    UnsupportedCharset(String),

    #[error("Invalid DataSource: data node {0} is not initialized")]
    NodeUnavailable(String),

    #[error("Unknown data node: {0}")]
    UnknownNode(String),

    #[error("Pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Cancelled(String),
}
