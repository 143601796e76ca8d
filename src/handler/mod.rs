//! Owners of backend connections.
//!
//! Every in-flight command on a backend connection belongs to exactly one `ResponseHandler`.
//! The connection's reassembler reports each logical response event to that handler; the
//! handler decides what reaches the client and when the connection goes back to the pool.

mod counter;
mod kill;
mod query;
mod release;
mod single;
mod transaction;

pub use counter::NodeCounter;
pub use kill::{KillConnectionHandler, KillLatch};
pub use query::MultiNodeQueryHandler;
pub use release::RollbackReleaseHandler;
pub use single::SingleNodeHandler;
pub use transaction::{TransactionHandler, TransactionKind};

use std::sync::Arc;

use bytes::Bytes;

use crate::pool::{BackendConnection, ConnectionError};

/// Callback sink for backend response events.
///
/// Calls for one connection are serialized. `connection_error` is terminal: no further call
/// follows it for the same invocation. Implementations must return quickly and hand longer
/// work to a spawned task.
pub trait ResponseHandler: Send + Sync {
    /// A pooled connection became available for this handler
    fn connection_acquired(&self, conn: Arc<BackendConnection>);

    /// Transport failure, acquisition failure, or protocol violation
    fn connection_error(&self, err: ConnectionError, conn: Option<&Arc<BackendConnection>>);

    fn ok_packet(&self, ok: Bytes, conn: &Arc<BackendConnection>);

    fn error_packet(&self, err: Bytes, conn: &Arc<BackendConnection>);

    fn fields_end(&self, header: Bytes, fields: Vec<Bytes>, eof: Bytes, conn: &Arc<BackendConnection>);

    fn row_acquired(&self, row: Bytes, conn: &Arc<BackendConnection>);

    fn row_end(&self, eof: Bytes, conn: &Arc<BackendConnection>);
}

/// Continuation handed to `Terminatable::terminate`
pub type Callback = Box<dyn FnOnce() + Send>;

/// A handler that can be asked to run a callback once it is no longer running
pub trait Terminatable: Send + Sync {
    /// Run `callback` now if idle, otherwise exactly once when the current invocation ends
    fn terminate(&self, callback: Callback);
}
