use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, instrument, warn};

use crate::config::DataSourceConfig;
use crate::protocol::response::SERVER_STATUS_AUTOCOMMIT;
use crate::protocol::{
    capabilities, charset, compute_auth_response, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec,
};

use super::connection::{BackendConnection, ConnectionError, ConnectionInfo};
use super::source::DataSource;

/// Opens physical backend connections for a data source
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        config: &DataSourceConfig,
        pool: Weak<DataSource>,
    ) -> Result<Arc<BackendConnection>, ConnectionError>;
}

/// TCP + mysql_native_password backend connector
#[derive(Debug, Clone)]
pub struct MySqlConnectionFactory {
    max_packet_size: usize,
    inbox_capacity: usize,
}

impl MySqlConnectionFactory {
    pub fn new(max_packet_size: usize, inbox_capacity: usize) -> Self {
        Self {
            max_packet_size,
            inbox_capacity,
        }
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    #[instrument(skip_all, fields(source = %config.name, addr = %config.addr()))]
    async fn connect(
        &self,
        config: &DataSourceConfig,
        pool: Weak<DataSource>,
    ) -> Result<Arc<BackendConnection>, ConnectionError> {
        let stream = TcpStream::connect(config.addr()).await.map_err(|e| {
            error!(error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, PacketCodec::new(self.max_packet_size));

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&handshake_packet.payload) {
            let err = ErrPacket::parse(&handshake_packet.payload)
                .map(|e| e.error_message)
                .unwrap_or_default();
            return Err(ConnectionError::Connect(err));
        }

        let handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %handshake.server_version,
            thread_id = handshake.connection_id,
            "Received backend handshake"
        );

        let mut caps = capabilities::BACKEND_CAPABILITIES & handshake.capability_flags;
        if config.database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: self.max_packet_size as u32,
            character_set: charset::index_of(&config.charset).unwrap_or(33),
            username: config.user.clone(),
            auth_response: compute_auth_response(&config.password, &handshake.scramble),
            database: config.database.clone(),
        };

        framed
            .send(response.encode(handshake_packet.sequence_id.wrapping_add(1)))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "Expected OK packet from backend (auth switch is not supported)".into(),
            ));
        }

        let autocommit = OkPacket::parse(&reply.payload)
            .map(|ok| ok.status_flags & SERVER_STATUS_AUTOCOMMIT != 0)
            .unwrap_or(true);

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = BackendConnection::new(
            ConnectionInfo {
                addr: config.addr(),
                thread_id: handshake.connection_id,
                capabilities: caps,
                charset: config.charset.clone(),
                autocommit,
            },
            tx,
            pool,
            self.inbox_capacity,
        );

        spawn_io(framed, rx, &conn);
        debug!(conn = %conn, "Backend connection established");
        Ok(conn)
    }
}

/// Split the socket into a reader feeding the connection and a writer draining `rx`
fn spawn_io(
    framed: Framed<TcpStream, PacketCodec>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    conn: &Arc<BackendConnection>,
) {
    let (mut sink, mut stream) = framed.split();
    let token = conn.shutdown_token();

    let writer_conn = Arc::downgrade(conn);
    let writer_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                packet = rx.recv() => {
                    let Some(packet) = packet else { break };
                    if let Err(e) = sink.send(packet).await {
                        warn!(error = %e, "Backend write failed");
                        if let Some(conn) = writer_conn.upgrade() {
                            conn.on_transport_error(ConnectionError::Io(e.to_string()));
                        }
                        return;
                    }
                }
                _ = writer_token.cancelled() => break,
            }
        }
        // Flush what was queued before the close, e.g. COM_QUIT
        while let Ok(packet) = rx.try_recv() {
            if sink.feed(packet).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_conn = Arc::downgrade(conn);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => {
                    let Some(conn) = reader_conn.upgrade() else { break };
                    match next {
                        Some(Ok(packet)) => conn.handle(packet),
                        Some(Err(e)) => {
                            conn.on_transport_error(ConnectionError::Io(e.to_string()));
                            break;
                        }
                        None => {
                            conn.on_transport_error(ConnectionError::Disconnected);
                            break;
                        }
                    }
                }
            }
        }
    });
}
