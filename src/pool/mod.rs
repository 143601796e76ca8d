mod connection;
mod factory;
mod manager;
mod node;
mod recorder;
mod source;

pub use connection::{BackendConnection, ConnectionError, ConnectionInfo, ConnectionState};
pub use factory::{ConnectionFactory, MySqlConnectionFactory};
pub use manager::PoolManager;
pub use node::DataNode;
pub use recorder::{SqlRecord, SqlRecorder};
pub use source::DataSource;
