//! Integration test entry point
//!
//! Run with: cargo test --test integration
//!
//! Every scenario runs against in-process scripted backends: `MockFactory` hands out real
//! `BackendConnection`s whose outbound commands are answered by a per-test script, and
//! `RecordingFrontend` captures every frame written to the client.

mod failover;
mod session;
mod transaction;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tessera::config::{Config, DataNodeConfig, DataSourceConfig, SystemConfig};
use tessera::pool::{
    BackendConnection, ConnectionError, ConnectionFactory, ConnectionInfo, DataSource,
    PoolManager,
};
use tessera::protocol::command::COM_QUERY;
use tessera::protocol::response::SERVER_STATUS_AUTOCOMMIT;
use tessera::protocol::{ErrPacket, OkPacket, Packet};
use tessera::session::FrontendConnection;

/// What a scripted backend does with one statement
pub enum Reply {
    /// Answer with these payloads, sequence ids from 1
    Packets(Vec<Bytes>),
    /// Never answer
    Silent,
}

type Script = dyn Fn(&str, &str) -> Reply + Send + Sync;

/// Opens scripted backends. The script sees `(data source name, statement)`.
pub struct MockFactory {
    script: Arc<Script>,
    down: Mutex<HashSet<String>>,
    next_thread: AtomicU32,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockFactory {
    pub fn new(script: impl Fn(&str, &str) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            down: Mutex::new(HashSet::new()),
            next_thread: AtomicU32::new(100),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Refuse (or accept again) new connections to a data source
    pub fn set_down(&self, source: &str, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(source.to_string());
        } else {
            set.remove(source);
        }
    }

    /// Every statement received so far, in arrival order
    pub fn statements(&self) -> Vec<(String, String)> {
        self.log.lock().clone()
    }

    pub fn count(&self, source: &str, sql: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(s, q)| s == source && q == sql)
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        config: &DataSourceConfig,
        pool: Weak<DataSource>,
    ) -> Result<Arc<BackendConnection>, ConnectionError> {
        if self.down.lock().contains(&config.name) {
            return Err(ConnectionError::Connect(format!("{} refused", config.name)));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        let conn = BackendConnection::new(
            ConnectionInfo {
                addr: config.addr(),
                thread_id: self.next_thread.fetch_add(1, Ordering::SeqCst),
                capabilities: 0,
                charset: config.charset.clone(),
                autocommit: true,
            },
            tx,
            pool,
            1024,
        );

        let weak = Arc::downgrade(&conn);
        let script = Arc::clone(&self.script);
        let log = Arc::clone(&self.log);
        let source = config.name.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if packet.kind() != Some(COM_QUERY) {
                    continue;
                }
                let sql = String::from_utf8_lossy(&packet.payload[1..]).into_owned();
                log.lock().push((source.clone(), sql.clone()));
                let Reply::Packets(payloads) = script(&source, &sql) else {
                    continue;
                };
                let Some(conn) = weak.upgrade() else { break };
                for (i, payload) in payloads.into_iter().enumerate() {
                    conn.handle(Packet::new((i + 1) as u8, payload));
                }
            }
        });
        Ok(conn)
    }
}

// ============================================================================
// Backend payloads
// ============================================================================

pub fn ok(affected_rows: u64, last_insert_id: u64) -> Bytes {
    OkPacket {
        affected_rows,
        last_insert_id,
        status_flags: SERVER_STATUS_AUTOCOMMIT,
        ..OkPacket::default()
    }
    .to_payload()
}

pub fn err(code: u16, message: &str) -> Bytes {
    ErrPacket::new(code, "HY000", message).to_payload()
}

pub fn eof() -> Bytes {
    Bytes::from_static(&[0xFE, 0x00, 0x00, 0x02, 0x00])
}

/// Single-column text row
pub fn row(value: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.len() + 1);
    buf.put_u8(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
    buf.freeze()
}

/// One-column result set: header, field, EOF, rows, EOF
pub fn result_set(values: &[&str]) -> Vec<Bytes> {
    let mut packets = vec![
        Bytes::from_static(&[0x01]),
        Bytes::from_static(b"\x03defcol"),
        eof(),
    ];
    packets.extend(values.iter().map(|v| row(v)));
    packets.push(eof());
    packets
}

// ============================================================================
// Client side
// ============================================================================

/// Frontend that keeps every frame written to it
pub struct RecordingFrontend {
    out: Mutex<BytesMut>,
    closed: AtomicBool,
    autocommit: AtomicBool,
    last_insert_id: AtomicU64,
}

impl RecordingFrontend {
    pub fn new(autocommit: bool) -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(BytesMut::new()),
            closed: AtomicBool::new(false),
            autocommit: AtomicBool::new(autocommit),
            last_insert_id: AtomicU64::new(0),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Frames written so far
    pub fn packets(&self) -> Vec<Packet> {
        let mut buf = self.out.lock().clone();
        let mut packets = Vec::new();
        while let Some(packet) = Packet::decode(&mut buf) {
            packets.push(packet);
        }
        packets
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id.load(Ordering::SeqCst)
    }
}

impl FrontendConnection for RecordingFrontend {
    fn write(&self, buf: BytesMut) {
        self.out.lock().extend_from_slice(&buf);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit.load(Ordering::SeqCst)
    }

    fn charset(&self) -> String {
        "utf8".to_string()
    }

    fn host(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn schema(&self) -> Option<String> {
        Some("orders".to_string())
    }

    fn set_last_insert_id(&self, id: u64) {
        self.last_insert_id.store(id, Ordering::SeqCst);
    }
}

// ============================================================================
// Setup helpers
// ============================================================================

pub fn data_source(name: &str) -> DataSourceConfig {
    DataSourceConfig {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 3306,
        user: "test".to_string(),
        password: String::new(),
        database: None,
        charset: "utf8".to_string(),
    }
}

/// Nodes as `(node name, [data source names])`
pub fn config(nodes: &[(&str, &[&str])]) -> Config {
    let mut data_sources = Vec::new();
    let mut data_nodes = Vec::new();
    for (node, sources) in nodes {
        data_sources.extend(sources.iter().map(|s| data_source(s)));
        let mut node = DataNodeConfig::new(*node, sources.iter().map(|s| s.to_string()).collect());
        node.pool_size = 8;
        node.wait_timeout_ms = 1_000;
        data_nodes.push(node);
    }
    Config {
        system: SystemConfig::default(),
        data_sources,
        data_nodes,
    }
}

pub async fn start(config: &Config, factory: &Arc<MockFactory>) -> Arc<PoolManager> {
    let pools = Arc::new(PoolManager::new(
        config,
        Arc::clone(factory) as Arc<dyn ConnectionFactory>,
    ));
    pools.init_all().await;
    pools
}

/// Poll `cond` until it holds; panics after five seconds
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

/// Error code of an ERR payload
pub fn error_code(packet: &Packet) -> Option<u16> {
    ErrPacket::parse(&packet.payload).map(|e| e.error_code)
}
