//! Per-client backend session.
//!
//! A `Session` owns the backend connections bound to one client connection (at most one per
//! shard for the current unit of work), picks the handler for each routed statement and runs
//! the termination chain when the client goes away.

mod frontend;
mod route;
mod terminator;

pub use frontend::{write_error, write_ok, write_packet, FrontendConnection};
pub use route::{RouteResult, ShardTarget, SqlType};
pub use terminator::Terminator;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::handler::{
    KillConnectionHandler, KillLatch, MultiNodeQueryHandler, ResponseHandler,
    RollbackReleaseHandler, SingleNodeHandler, Terminatable, TransactionHandler,
    TransactionKind,
};
use crate::pool::{BackendConnection, PoolManager};
use crate::protocol::error_code::ER_NO_DB_ERROR;
use crate::protocol::OkPacket;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handlers of the latest invocation of each kind, for the termination chain
#[derive(Default)]
struct Slots {
    single: Option<Weak<SingleNodeHandler>>,
    multi: Option<Weak<MultiNodeQueryHandler>>,
    commit: Option<Weak<TransactionHandler>>,
    rollback: Option<Weak<TransactionHandler>>,
}

pub struct Session {
    id: u64,
    frontend: Arc<dyn FrontendConnection>,
    pools: Arc<PoolManager>,
    target: DashMap<ShardTarget, Arc<BackendConnection>>,
    terminating: AtomicBool,
    slots: Mutex<Slots>,
}

impl Session {
    pub fn new(frontend: Arc<dyn FrontendConnection>, pools: Arc<PoolManager>) -> Arc<Self> {
        Arc::new(Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            frontend,
            pools,
            target: DashMap::new(),
            terminating: AtomicBool::new(false),
            slots: Mutex::new(Slots::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn frontend(&self) -> &Arc<dyn FrontendConnection> {
        &self.frontend
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// The client connection is gone
    pub fn is_closed(&self) -> bool {
        self.frontend.is_closed()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub fn bound_count(&self) -> usize {
        self.target.len()
    }

    pub fn bound_targets(&self) -> Vec<ShardTarget> {
        self.target.iter().map(|e| e.key().clone()).collect()
    }

    pub fn bound_connection(&self, target: &ShardTarget) -> Option<Arc<BackendConnection>> {
        self.target.get(target).map(|e| Arc::clone(e.value()))
    }

    /// Returns the connection previously bound to the same shard
    pub fn bind_connection(
        &self,
        target: ShardTarget,
        conn: Arc<BackendConnection>,
    ) -> Option<Arc<BackendConnection>> {
        self.target.insert(target, conn)
    }

    pub fn unbind_connection(&self, target: &ShardTarget) -> Option<Arc<BackendConnection>> {
        self.target.remove(target).map(|(_, c)| c)
    }

    /// Unbind and close. False if nothing was bound.
    pub fn close_connection(&self, target: &ShardTarget) -> bool {
        match self.unbind_connection(target) {
            Some(conn) => {
                conn.close("closed by session");
                true
            }
            None => false,
        }
    }

    /// Unbind every connection and hand it back after a completed unit of work
    pub fn release_connections(&self) {
        for key in self.bound_targets() {
            let Some(conn) = self.unbind_connection(&key) else {
                continue;
            };
            conn.set_attachment(None);
            if conn.is_running() {
                error!(session = self.id, conn = %conn, "Running connection found on release");
                conn.close("running on release");
            } else if !conn.is_closed() {
                if self.is_closed() {
                    conn.quit();
                } else {
                    conn.release();
                }
            }
        }
    }

    /// Unbind every connection after a failure or on teardown.
    ///
    /// Running connections are closed, autocommit ones released and the rest rolled back
    /// before they return to the pool. With `pessimistic` set a closed client closes them all.
    pub fn clear_connections(&self, pessimistic: bool) {
        for key in self.bound_targets() {
            let Some(conn) = self.unbind_connection(&key) else {
                continue;
            };
            if conn.is_closed() {
                continue;
            }
            if conn.is_running() || (pessimistic && self.is_closed()) {
                conn.close("cleared by session");
                continue;
            }
            if conn.is_autocommit() {
                conn.release();
                continue;
            }
            conn.set_handler(Arc::new(RollbackReleaseHandler) as Arc<dyn ResponseHandler>);
            if conn.rollback().is_err() {
                conn.close("rollback failed");
            }
        }
    }

    /// Dispatch one routed statement
    pub fn execute(self: &Arc<Self>, route: RouteResult) {
        debug!(session = self.id, targets = route.targets.len(), sql_type = route.sql_type.label(), "Execute");
        match route.targets.len() {
            0 => write_error(self.frontend.as_ref(), 1, ER_NO_DB_ERROR, "No dataNode selected"),
            1 => {
                let Some(target) = route.targets.into_iter().next() else {
                    return;
                };
                let handler = SingleNodeHandler::new(target, Arc::clone(self));
                self.slots.lock().single = Some(Arc::downgrade(&handler));
                handler.execute();
            }
            _ => {
                // A multi-shard write under client autocommit runs in a transaction that is
                // committed once every shard answered
                let autocommit = self.frontend.is_autocommit() && !route.sql_type.is_modify();
                let handler =
                    MultiNodeQueryHandler::new(route.targets, autocommit, Arc::clone(self));
                self.slots.lock().multi = Some(Arc::downgrade(&handler));
                handler.execute();
            }
        }
    }

    pub fn commit(self: &Arc<Self>) {
        self.commit_with(None);
    }

    /// Commit every bound connection, answering with `ok` instead of the backend's OK
    pub fn commit_with(self: &Arc<Self>, ok: Option<OkPacket>) {
        if self.target.is_empty() {
            write_ok(self.frontend.as_ref(), 1, &ok.unwrap_or_else(OkPacket::new));
            return;
        }
        let handler = TransactionHandler::new(TransactionKind::Commit, Arc::clone(self));
        self.slots.lock().commit = Some(Arc::downgrade(&handler));
        handler.run(ok);
    }

    pub fn rollback(self: &Arc<Self>) {
        if self.target.is_empty() {
            write_ok(self.frontend.as_ref(), 1, &OkPacket::new());
            return;
        }
        let handler = TransactionHandler::new(TransactionKind::Rollback, Arc::clone(self));
        self.slots.lock().rollback = Some(Arc::downgrade(&handler));
        handler.run(None);
    }

    /// Tear down after the client connection closed. A concurrent second call is a no-op.
    ///
    /// Order: kill every running backend statement and wait for the kills, wait for each
    /// pending handler to stop, clear what is still bound, then allow terminating again.
    pub fn terminate(self: &Arc<Self>) {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(session = self.id, bound = self.bound_count(), "Terminating session");

        let session = Arc::clone(self);
        self.kill(Box::new(move || {
            let (single, multi, commit, rollback) = {
                let slots = session.slots.lock();
                (
                    upgrade(&slots.single),
                    upgrade(&slots.multi),
                    upgrade(&slots.commit),
                    upgrade(&slots.rollback),
                )
            };
            let clear = Arc::clone(&session);
            Terminator::new()
                .then(single)
                .then(multi)
                .then(commit)
                .then(rollback)
                .then_run(move || clear.clear_connections(false))
                .then_run(move || session.terminating.store(false, Ordering::Release))
                .invoke();
        }));
    }

    /// Send `KILL <thread>` for every running bound connection; `done` runs after all finish
    fn kill(self: &Arc<Self>, done: crate::handler::Callback) {
        let killees: Vec<_> = self
            .target
            .iter()
            .filter(|e| e.value().is_running())
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        if killees.is_empty() {
            done();
            return;
        }

        let latch = KillLatch::new(killees.len(), done);
        for (target, killee) in killees {
            let handler = KillConnectionHandler::new(killee, Arc::clone(&latch));
            let acquired = match self.pools.node(&target.name) {
                Some(node) => node.get_connection(
                    Arc::clone(&handler) as Arc<dyn ResponseHandler>,
                    Some(target.clone()),
                ),
                None => Err(crate::pool::ConnectionError::UnknownNode(target.name.clone())),
            };
            if let Err(e) = acquired {
                error!(session = self.id, node = %target.name, error = %e, "Failed to get killer connection");
                handler.connection_error(e, None);
            }
        }
    }
}

fn upgrade<T: Terminatable + 'static>(slot: &Option<Weak<T>>) -> Option<Arc<dyn Terminatable>> {
    slot.as_ref()
        .and_then(Weak::upgrade)
        .map(|h| h as Arc<dyn Terminatable>)
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("bound", &self.bound_count())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}
