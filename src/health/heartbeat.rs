//! Liveness probe for one data source.
//!
//! Each data source owns a `Heartbeat` with a dedicated detector connection outside the pool.
//! On every tick the configured statement is sent; the response is classified into a
//! `HeartbeatStatus`. Too many consecutive failures on the node's active source make the
//! node fail over to the next source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{DataNodeConfig, DataSourceConfig};
use crate::handler::ResponseHandler;
use crate::metrics::metrics;
use crate::pool::{BackendConnection, ConnectionError, ConnectionFactory, DataNode, DataSource};
use crate::protocol::error_code::ER_SERVER_SHUTDOWN;
use crate::protocol::ErrPacket;

use super::state::{HeartbeatStatus, SourceHealth, Verdict};

#[derive(Default)]
struct ProbeState {
    health: SourceHealth,
    detector: Option<Arc<BackendConnection>>,
    /// Set while a probe (or the detector connect) is outstanding
    probe_started: Option<Instant>,
    connecting: bool,
}

pub struct Heartbeat {
    source_index: usize,
    config: DataSourceConfig,
    sql: Option<String>,
    retry: u32,
    timeout: Duration,
    factory: Arc<dyn ConnectionFactory>,
    source: Weak<DataSource>,
    node: Weak<DataNode>,
    state: Mutex<ProbeState>,
    stopped: AtomicBool,
    me: Weak<Heartbeat>,
}

impl Heartbeat {
    pub fn new(
        source_index: usize,
        config: DataSourceConfig,
        node_config: &DataNodeConfig,
        factory: Arc<dyn ConnectionFactory>,
        source: Weak<DataSource>,
        node: Weak<DataNode>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            source_index,
            config,
            sql: node_config.heartbeat_sql.clone(),
            retry: node_config.heartbeat_retry,
            timeout: node_config.heartbeat_timeout(),
            factory,
            source,
            node,
            state: Mutex::new(ProbeState::default()),
            stopped: AtomicBool::new(true),
            me: me.clone(),
        })
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.state.lock().health.status
    }

    pub fn error_count(&self) -> u32 {
        self.state.lock().health.error_count
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        self.state.lock().health.reset();
        self.stopped.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let detector = {
            let mut state = self.state.lock();
            state.probe_started = None;
            state.detector.take()
        };
        if let Some(conn) = detector {
            conn.clear_handler();
            conn.close("heartbeat stopped");
        }
    }

    /// One timer tick
    pub fn heartbeat(&self) {
        let Some(sql) = self.sql.as_deref() else {
            return;
        };
        if self.is_stopped() {
            return;
        }

        let mut state = self.state.lock();
        let outstanding = state.probe_started;
        if let Some(started) = outstanding {
            if started.elapsed() < self.timeout {
                return;
            }
            drop(state);
            self.set_result(HeartbeatStatus::Timeout, "heartbeat timeout");
            return;
        }
        if state.connecting {
            return;
        }
        state.probe_started = Some(Instant::now());

        let detector = state.detector.clone().filter(|conn| !conn.is_closed());
        match detector {
            Some(conn) => {
                drop(state);
                self.probe(&conn, sql);
            }
            None => {
                state.detector = None;
                state.connecting = true;
                drop(state);
                self.spawn_connect();
            }
        }
    }

    fn spawn_connect(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            // The detector is not counted against the pool: no pool back-reference
            let connect = me.factory.connect(&me.config, Weak::new());
            let result = match tokio::time::timeout(me.timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(me.timeout)),
            };

            match result {
                Ok(conn) => {
                    conn.try_acquire();
                    conn.set_handler(Arc::clone(&me) as Arc<dyn ResponseHandler>);
                    let stopped = {
                        let mut state = me.state.lock();
                        state.connecting = false;
                        if !me.is_stopped() {
                            state.detector = Some(Arc::clone(&conn));
                        }
                        me.is_stopped()
                    };
                    if stopped {
                        conn.clear_handler();
                        conn.close("heartbeat stopped");
                        return;
                    }
                    if let Some(sql) = me.sql.as_deref() {
                        me.probe(&conn, sql);
                    }
                }
                Err(e) => {
                    me.state.lock().connecting = false;
                    me.set_result(HeartbeatStatus::Error, &e.to_string());
                }
            }
        });
    }

    fn probe(&self, conn: &Arc<BackendConnection>, sql: &str) {
        let charset = conn.charset();
        if let Err(e) = conn.execute(sql, &charset, conn.is_autocommit()) {
            warn!(source = %self.config.name, error = %e, "Failed to send heartbeat");
            self.drop_detector(conn);
            self.set_result(HeartbeatStatus::Error, &e.to_string());
        }
    }

    fn drop_detector(&self, conn: &Arc<BackendConnection>) {
        {
            let mut state = self.state.lock();
            if state.detector.as_ref().map(|d| d.id()) == Some(conn.id()) {
                state.detector = None;
            }
        }
        conn.clear_handler();
        conn.close("heartbeat detector dropped");
    }

    /// Record a probe outcome and fail the node over when the retry budget is spent
    fn set_result(&self, result: HeartbeatStatus, reason: &str) {
        metrics().record_heartbeat(result.label());
        if self.is_stopped() {
            return;
        }

        let (verdict, error_count, timed_out) = {
            let mut state = self.state.lock();
            state.probe_started = None;
            let timed_out = if result == HeartbeatStatus::Timeout {
                state.detector.take()
            } else {
                None
            };
            let verdict = state.health.record(result, self.retry);
            (verdict, state.health.error_count, timed_out)
        };

        if let Some(conn) = timed_out {
            conn.clear_handler();
            conn.close("heartbeat timeout");
        }

        match verdict {
            Verdict::Healthy => debug!(source = %self.config.name, "Heartbeat ok"),
            Verdict::Suspect => warn!(
                source = %self.config.name,
                status = result.label(),
                error_count,
                reason,
                "Heartbeat failed"
            ),
            Verdict::Failed => self.fail_over(error_count, reason),
        }
    }

    fn fail_over(&self, error_count: u32, reason: &str) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        self.state.lock().health.error_count = 0;

        // Only the active source can drag its node along
        if node.active_index() != self.source_index {
            return;
        }
        let next = node.next(self.source_index);
        let reason = format!(
            "heartbeat of {} failed {} times: {}",
            self.config.name, error_count, reason
        );
        node.switch_source(next, true, &reason);
    }

    fn error_status(err: &[u8]) -> HeartbeatStatus {
        match ErrPacket::parse(err) {
            Some(e) if e.error_code == ER_SERVER_SHUTDOWN => HeartbeatStatus::Off,
            _ => HeartbeatStatus::Error,
        }
    }
}

impl ResponseHandler for Heartbeat {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        // Detectors are opened directly, never through the pool
        conn.release();
    }

    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>) {
        if let Some(conn) = conn {
            let mut state = self.state.lock();
            if state.detector.as_ref().map(|d| d.id()) == Some(conn.id()) {
                state.detector = None;
            }
        }
        self.set_result(HeartbeatStatus::Error, &err.to_string());
    }

    fn ok_packet(&self, _ok: Bytes, conn: &Arc<BackendConnection>) {
        match conn.advance_status_sync() {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                self.drop_detector(conn);
                self.set_result(HeartbeatStatus::Error, &e.to_string());
                return;
            }
        }
        conn.set_running(false);
        self.set_result(HeartbeatStatus::Ok, "ok");
    }

    fn error_packet(&self, err: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        let status = Self::error_status(&err);
        let message = ErrPacket::parse(&err)
            .map(|e| e.error_message)
            .unwrap_or_default();
        self.set_result(status, &message);
    }

    fn fields_end(&self, _header: Bytes, _fields: Vec<Bytes>, _eof: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_acquired(&self, _row: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_end(&self, _eof: Bytes, conn: &Arc<BackendConnection>) {
        conn.set_running(false);
        self.set_result(HeartbeatStatus::Ok, "ok");
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("source", &self.config.name)
            .field("status", &self.status())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
