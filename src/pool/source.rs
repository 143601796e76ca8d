use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{DataNodeConfig, DataSourceConfig, SystemConfig};
use crate::handler::ResponseHandler;
use crate::health::{Heartbeat, HeartbeatStatus};
use crate::session::ShardTarget;

use super::connection::{BackendConnection, ConnectionError};
use super::factory::ConnectionFactory;
use super::node::DataNode;
use super::recorder::SqlRecorder;

/// One physical backend endpoint with its bounded connection pool
pub struct DataSource {
    index: usize,
    node_name: String,
    config: DataSourceConfig,
    size: usize,
    wait_timeout: Duration,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections, most recently released at the back
    idle: Mutex<VecDeque<Arc<BackendConnection>>>,
    /// Open connections counted against `size`, idle or not
    total: AtomicUsize,
    heartbeat: Arc<Heartbeat>,
    recorder: SqlRecorder,
    me: Weak<DataSource>,
}

impl DataSource {
    pub fn new(
        index: usize,
        config: DataSourceConfig,
        node_config: &DataNodeConfig,
        system: &SystemConfig,
        factory: Arc<dyn ConnectionFactory>,
        node: Weak<DataNode>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<DataSource>| Self {
            index,
            node_name: node_config.name.clone(),
            heartbeat: Heartbeat::new(
                index,
                config.clone(),
                node_config,
                Arc::clone(&factory),
                me.clone(),
                node,
            ),
            config,
            size: node_config.pool_size.max(1),
            wait_timeout: node_config.wait_timeout(),
            factory,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            recorder: SqlRecorder::new(system.sql_record_capacity, system.slow_sql_threshold()),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Pool capacity
    pub fn size(&self) -> usize {
        self.size
    }

    /// Open connections, idle or in use
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.total().saturating_sub(self.idle_count())
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn recorder(&self) -> &SqlRecorder {
        &self.recorder
    }

    /// Hand a connection to `handler`.
    ///
    /// With an idle connection available `connection_acquired` runs before this returns;
    /// otherwise a new connection is opened in the background and the handler hears back
    /// through `connection_acquired` or `connection_error`.
    pub fn get_connection(
        &self,
        handler: Arc<dyn ResponseHandler>,
        attachment: Option<ShardTarget>,
    ) -> Result<(), ConnectionError> {
        if let Some(conn) = self.take_idle() {
            conn.set_attachment(attachment);
            handler.connection_acquired(conn);
            return Ok(());
        }

        if !self.reserve() {
            return Err(ConnectionError::PoolExhausted(self.config.name.clone()));
        }
        let Some(me) = self.me.upgrade() else {
            self.total.fetch_sub(1, Ordering::AcqRel);
            return Err(ConnectionError::Closed(self.config.name.clone()));
        };

        tokio::spawn(async move {
            match me.connect_reserved().await {
                Ok(conn) => {
                    conn.try_acquire();
                    conn.set_attachment(attachment);
                    handler.connection_acquired(conn);
                }
                Err(e) => {
                    warn!(source = %me.config.name, error = %e, "Failed to open backend connection");
                    handler.connection_error(e, None);
                }
            }
        });
        Ok(())
    }

    fn take_idle(&self) -> Option<Arc<BackendConnection>> {
        loop {
            let conn = self.idle.lock().pop_back()?;
            if conn.try_acquire() {
                return Some(conn);
            }
        }
    }

    /// Claim one slot of the pool's capacity
    fn reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.size).then_some(n + 1)
            })
            .is_ok()
    }

    /// Open a connection for an already reserved slot; the slot is returned on failure
    async fn connect_reserved(&self) -> Result<Arc<BackendConnection>, ConnectionError> {
        let result =
            match tokio::time::timeout(self.wait_timeout, self.factory.connect(&self.config, self.me.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(self.wait_timeout)),
            };
        if result.is_err() {
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Open up to `size` connections at once and return them to the pool.
    ///
    /// Fails (closing whatever was opened) if any one of them cannot be opened.
    pub async fn smoke_test(&self, size: usize) -> Result<(), ConnectionError> {
        let count = size.min(self.size);
        let mut opened = Vec::with_capacity(count);
        let mut failure = None;

        for _ in 0..count {
            if !self.reserve() {
                failure = Some(ConnectionError::PoolExhausted(self.config.name.clone()));
                break;
            }
            match self.connect_reserved().await {
                Ok(conn) => {
                    conn.try_acquire();
                    opened.push(conn);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                for conn in opened {
                    conn.release();
                }
                Ok(())
            }
            Some(e) => {
                for conn in opened {
                    conn.close("init failed");
                }
                Err(e)
            }
        }
    }

    pub(crate) fn release_channel(&self, conn: Arc<BackendConnection>) {
        self.idle.lock().push_back(conn);
    }

    pub(crate) fn on_closed(&self, id: u64) {
        self.idle.lock().retain(|c| c.id() != id);
        let _ = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Close idle connections unused for longer than `timeout`
    pub fn idle_check(&self, timeout: Duration) {
        let expired: Vec<_> = {
            let mut idle = self.idle.lock();
            let (expired, keep): (VecDeque<_>, VecDeque<_>) =
                idle.drain(..).partition(|c| c.idle_for() > timeout);
            *idle = keep;
            expired.into_iter().collect()
        };
        if !expired.is_empty() {
            debug!(source = %self.config.name, closed = expired.len(), "Closed idle connections");
        }
        for conn in expired {
            conn.close("idle timeout");
        }
    }

    /// Close every idle connection
    pub fn clear(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        if !drained.is_empty() {
            info!(source = %self.config.name, closed = drained.len(), "Cleared data source");
        }
        for conn in drained {
            conn.close("data source cleared");
        }
    }

    pub fn start_heartbeat(&self) {
        self.heartbeat.start();
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat.stop();
    }

    pub fn do_heartbeat(&self) {
        self.heartbeat.heartbeat();
    }

    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        self.heartbeat.status()
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.config.name)
            .field("index", &self.index)
            .field("node", &self.node_name)
            .field("total", &self.total())
            .finish()
    }
}
