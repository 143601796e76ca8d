use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SystemConfig};

use super::factory::ConnectionFactory;
use super::node::DataNode;
use super::recorder::SqlRecord;

/// Registry of every data node in the process.
///
/// Constructed once at startup and handed to sessions; there is no global instance.
pub struct PoolManager {
    nodes: HashMap<String, Arc<DataNode>>,
    system: SystemConfig,
}

impl PoolManager {
    /// Build all nodes from a validated config. Nothing is connected until `init_all`.
    pub fn new(config: &Config, factory: Arc<dyn ConnectionFactory>) -> Self {
        let nodes = config
            .data_nodes
            .iter()
            .map(|node| {
                let sources = node
                    .data_sources
                    .iter()
                    .filter_map(|name| config.data_source(name).cloned())
                    .collect();
                let data_node = DataNode::new(
                    node.clone(),
                    sources,
                    &config.system,
                    Arc::clone(&factory),
                );
                (node.name.clone(), data_node)
            })
            .collect();

        Self {
            nodes,
            system: config.system.clone(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&Arc<DataNode>> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<DataNode>> {
        self.nodes.values()
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    /// Initialise every node and start probing its active source.
    ///
    /// Returns the number of nodes that came up. A node that failed stays registered (and
    /// probed) so a later switch can recover it.
    pub async fn init_all(&self) -> usize {
        let mut ready = 0;
        for node in self.nodes.values() {
            let config = node.config();
            if node.init(config.init_size, config.init_index).await {
                ready += 1;
            }
            node.start_heartbeat();
        }
        info!(ready, total = self.nodes.len(), "Data nodes initialised");
        ready
    }

    /// Spawn the periodic heartbeat and idle-check tasks. Both stop when `cancel` fires.
    pub fn spawn_timers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let pools = Arc::clone(self);
            spawn_periodic(
                "heartbeat",
                self.system.heartbeat_period(),
                cancel.clone(),
                move || {
                    for node in pools.nodes() {
                        node.do_heartbeat();
                    }
                },
            )
        };
        let idle_check = {
            let pools = Arc::clone(self);
            spawn_periodic(
                "idle_check",
                self.system.idle_check_period(),
                cancel,
                move || {
                    for node in pools.nodes() {
                        node.idle_check();
                    }
                },
            )
        };
        vec![heartbeat, idle_check]
    }

    /// Operator-initiated switch of a node's active source
    pub fn switch_source(&self, node: &str, index: usize, reason: &str) -> bool {
        match self.nodes.get(node) {
            Some(n) => n.switch_source(index, false, reason),
            None => {
                warn!(node = %node, "Switch requested for unknown data node");
                false
            }
        }
    }

    /// Slow statements across every source, slowest first
    pub fn slow_records(&self) -> Vec<SqlRecord> {
        let mut records: Vec<_> = self
            .nodes
            .values()
            .flat_map(|n| n.sources().iter())
            .flat_map(|s| s.recorder().records())
            .collect();
        records.sort_by(|a, b| b.duration.cmp(&a.duration));
        records
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        // Random initial delay to stagger timers (0-100% of period)
        let initial_delay = rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(initial_delay)) => {}
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(timer = name, "Timer cancelled");
                    break;
                }
                _ = ticker.tick() => tick(),
            }
        }
    })
}
