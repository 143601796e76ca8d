//! The client-facing side as seen from the backend core

use bytes::BytesMut;

use crate::protocol::{write_frame, ErrPacket, OkPacket};

/// A client connection that receives finished wire frames.
///
/// The listener and its authentication live elsewhere; this core only writes whole frames
/// and reads a few session attributes.
pub trait FrontendConnection: Send + Sync {
    /// Queue framed bytes for the client
    fn write(&self, buf: BytesMut);

    fn is_closed(&self) -> bool;

    fn is_autocommit(&self) -> bool;

    /// Charset name the client's statements must be encoded in
    fn charset(&self) -> String;

    fn host(&self) -> String;

    fn schema(&self) -> Option<String>;

    fn set_last_insert_id(&self, id: u64);
}

/// Write one frame
pub fn write_packet(front: &dyn FrontendConnection, sequence_id: u8, payload: &[u8]) {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    write_frame(&mut buf, sequence_id, payload);
    front.write(buf);
}

pub fn write_ok(front: &dyn FrontendConnection, sequence_id: u8, ok: &OkPacket) {
    write_packet(front, sequence_id, &ok.to_payload());
}

/// ERR frame with SQL state HY000
pub fn write_error(front: &dyn FrontendConnection, sequence_id: u8, code: u16, message: &str) {
    let err = ErrPacket::new(code, "HY000", message);
    write_packet(front, sequence_id, &err.to_payload());
}
