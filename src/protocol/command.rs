//! Commands this core sends to backends

use bytes::{BufMut, BytesMut};

use super::charset;
use super::packet::Packet;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;

/// COM_QUERY frame carrying `sql` encoded in `charset`; `None` if the charset can't represent it
pub fn query(sql: &str, charset: &str) -> Option<Packet> {
    let text = charset::encode(sql, charset)?;
    let mut buf = BytesMut::with_capacity(1 + text.len());
    buf.put_u8(COM_QUERY);
    buf.extend_from_slice(&text);
    Some(Packet::new(0, buf.freeze()))
}

/// COM_QUERY frame for `KILL <thread_id>`
pub fn kill(thread_id: u32) -> Packet {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(COM_QUERY);
    buf.extend_from_slice(format!("KILL {}", thread_id).as_bytes());
    Packet::new(0, buf.freeze())
}

pub fn quit() -> Packet {
    Packet::new(0, vec![COM_QUIT])
}

/// Statement that brings a connection's session variables in line
pub fn status_sync_sql(charset: &str, autocommit: bool) -> String {
    format!(
        "SET names {}, autocommit={}",
        charset,
        if autocommit { 1 } else { 0 }
    )
}
