use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::{DataNodeConfig, DataSourceConfig, SystemConfig};
use crate::handler::ResponseHandler;
use crate::health::HeartbeatStatus;
use crate::metrics::metrics;
use crate::session::ShardTarget;

use super::connection::ConnectionError;
use super::factory::ConnectionFactory;
use super::source::DataSource;

/// A shard: an ordered failover group of data sources with exactly one active member
pub struct DataNode {
    name: String,
    config: DataNodeConfig,
    sources: Vec<Arc<DataSource>>,
    active_index: AtomicUsize,
    switch_lock: Mutex<()>,
    init_success: AtomicBool,
    execute_count: AtomicU64,
    /// Probing is suspended until this instant
    heartbeat_recovery: Mutex<Option<Instant>>,
}

impl DataNode {
    /// `sources` must be in failover order and non-empty
    pub fn new(
        config: DataNodeConfig,
        sources: Vec<DataSourceConfig>,
        system: &SystemConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<DataNode>| {
            let sources = sources
                .into_iter()
                .enumerate()
                .map(|(i, ds)| {
                    DataSource::new(i, ds, &config, system, Arc::clone(&factory), me.clone())
                })
                .collect();
            Self {
                name: config.name.clone(),
                active_index: AtomicUsize::new(config.init_index),
                config,
                sources,
                switch_lock: Mutex::new(()),
                init_success: AtomicBool::new(false),
                execute_count: AtomicU64::new(0),
                heartbeat_recovery: Mutex::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DataNodeConfig {
        &self.config
    }

    pub fn sources(&self) -> &[Arc<DataSource>] {
        &self.sources
    }

    pub fn active_index(&self) -> usize {
        self.active_index.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.init_success.load(Ordering::Acquire)
    }

    pub fn execute_count(&self) -> u64 {
        self.execute_count.load(Ordering::Relaxed)
    }

    /// The active data source
    pub fn source(&self) -> Option<&Arc<DataSource>> {
        let source = self.sources.get(self.active_index());
        if source.is_none() {
            error!(target: "alarm", node = %self.name, "Data node has no active data source");
        }
        source
    }

    fn check_index(&self, index: usize) -> bool {
        index < self.sources.len()
    }

    /// Index after `index` in failover order, wrapping around
    pub fn next(&self, index: usize) -> usize {
        if !self.check_index(index) || index + 1 == self.sources.len() {
            0
        } else {
            index + 1
        }
    }

    /// Try sources starting at `index`, wrapping around, and activate the first one on which
    /// `size` connections can be opened.
    ///
    /// Failing every source leaves the node uninitialised; it rejects `get_connection` until a
    /// later switch succeeds.
    pub async fn init(&self, size: usize, index: usize) -> bool {
        let start = if self.check_index(index) { index } else { 0 };
        let count = self.sources.len();

        for i in 0..count {
            let j = (start + i) % count;
            let source = &self.sources[j];
            match source.smoke_test(size).await {
                Ok(()) => {
                    self.active_index.store(j, Ordering::Release);
                    self.init_success.store(true, Ordering::Release);
                    info!(node = %self.name, index = j, source = %source.name(), "Data node init success");
                    return true;
                }
                Err(e) => {
                    warn!(node = %self.name, index = j, source = %source.name(), error = %e, "Data source init error");
                }
            }
        }

        self.init_success.store(false, Ordering::Release);
        error!(target: "alarm", node = %self.name, "Data node init failure");
        false
    }

    /// Make `new_index` the active source.
    ///
    /// No-op when it already is (and the node is initialised). Failure-driven switches pass
    /// `is_alarm = true` and log at alarm severity; operator switches log a warning.
    pub fn switch_source(&self, new_index: usize, is_alarm: bool, reason: &str) -> bool {
        if !self.check_index(new_index) {
            return false;
        }
        let _guard = self.switch_lock.lock();

        let current = self.active_index();
        if current == new_index && self.is_initialized() {
            return false;
        }

        let next = &self.sources[new_index];
        next.clear();
        next.start_heartbeat();

        self.active_index.store(new_index, Ordering::Release);

        if current != new_index {
            if let Some(prev) = self.sources.get(current) {
                prev.clear();
                prev.stop_heartbeat();
            }
        }
        self.init_success.store(true, Ordering::Release);
        metrics().record_switch(&self.name);

        if is_alarm {
            error!(
                target: "alarm",
                "DATANODE_SWITCH [name={},result=[{}->{}],reason={}]",
                self.name, current, new_index, reason
            );
        } else {
            warn!(
                "[name={},result=[{}->{}],reason={}]",
                self.name, current, new_index, reason
            );
        }
        true
    }

    /// Hand a connection of the active source to `handler`
    pub fn get_connection(
        &self,
        handler: Arc<dyn ResponseHandler>,
        attachment: Option<ShardTarget>,
    ) -> Result<(), ConnectionError> {
        if !self.is_initialized() {
            return Err(ConnectionError::NodeUnavailable(self.name.clone()));
        }
        let source = self
            .source()
            .ok_or_else(|| ConnectionError::NodeUnavailable(self.name.clone()))?;
        self.execute_count.fetch_add(1, Ordering::Relaxed);
        source.get_connection(handler, attachment)
    }

    pub fn idle_check(&self) {
        let timeout = self.config.idle_timeout();
        for source in &self.sources {
            source.idle_check(timeout);
        }
    }

    /// Suspend probing until `until`; `None` resumes it
    pub fn set_heartbeat_recovery(&self, until: Option<Instant>) {
        *self.heartbeat_recovery.lock() = until;
    }

    pub fn heartbeat_recovery(&self) -> Option<Instant> {
        *self.heartbeat_recovery.lock()
    }

    /// One heartbeat tick for the active source
    pub fn do_heartbeat(&self) {
        if !self.config.need_heartbeat() || self.sources.is_empty() {
            return;
        }
        if matches!(self.heartbeat_recovery(), Some(until) if Instant::now() < until) {
            return;
        }
        if let Some(source) = self.source() {
            source.do_heartbeat();
        }
    }

    pub fn start_heartbeat(&self) {
        if let Some(source) = self.source() {
            source.start_heartbeat();
        }
    }

    pub fn stop_heartbeat(&self) {
        if let Some(source) = self.source() {
            source.stop_heartbeat();
        }
    }

    pub fn heartbeat_status(&self) -> Option<HeartbeatStatus> {
        self.source().map(|s| s.heartbeat_status())
    }
}

impl std::fmt::Debug for DataNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataNode")
            .field("name", &self.name)
            .field("active_index", &self.active_index())
            .field("initialized", &self.is_initialized())
            .field("sources", &self.sources.len())
            .finish()
    }
}
