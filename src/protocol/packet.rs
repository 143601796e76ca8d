use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header: 3 bytes payload length + 1 byte sequence id
pub const PACKET_HEADER_SIZE: usize = 4;
/// Largest payload a single frame can describe
pub const MAX_PAYLOAD_SIZE: usize = 0xFF_FF_FF;

/// First payload byte of an OK response
pub const OK_HEADER: u8 = 0x00;
/// First payload byte of an EOF marker
pub const EOF_HEADER: u8 = 0xFE;
/// First payload byte of an ERR response
pub const ERR_HEADER: u8 = 0xFF;

/// One framed backend message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Append header + payload to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        write_frame(dst, self.sequence_id, &self.payload);
    }

    /// Split one complete frame off the front of `src`.
    ///
    /// Returns `None` while the buffer holds less than a full frame.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        let len = peek_payload_len(src)?;
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// Type byte of the payload, if any
    pub fn kind(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Payload length announced by a frame header, once the header is buffered
pub fn peek_payload_len(src: &[u8]) -> Option<usize> {
    if src.len() < PACKET_HEADER_SIZE {
        return None;
    }
    Some(src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16))
}

/// Write a frame for an already-built payload under a new sequence id
pub fn write_frame(dst: &mut BytesMut, sequence_id: u8, payload: &[u8]) {
    let len = payload.len();
    dst.reserve(PACKET_HEADER_SIZE + len);
    dst.put_u8((len & 0xFF) as u8);
    dst.put_u8(((len >> 8) & 0xFF) as u8);
    dst.put_u8(((len >> 16) & 0xFF) as u8);
    dst.put_u8(sequence_id);
    dst.extend_from_slice(payload);
}

/// Whether the payload is an OK response
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Whether the payload is an ERR response
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Whether the payload is an EOF marker.
///
/// A row may also start with 0xFE (8-byte length prefix) but is then at least 9 bytes long.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Append a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 1 << 16 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 1 << 24 {
        buf.put_u8(0xFD);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Read a length-encoded integer, advancing `buf` past it.
///
/// Returns `None` for the NULL marker (0xFB), the reserved 0xFF prefix or truncated input.
pub fn get_lenenc_int(buf: &mut &[u8]) -> Option<u64> {
    let first = *buf.first()?;
    let width = match first {
        0x00..=0xFA => {
            buf.advance(1);
            return Some(first as u64);
        }
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        _ => return None,
    };
    if buf.len() < 1 + width {
        return None;
    }
    buf.advance(1);
    Some(buf.get_uint_le(width))
}

/// MySQL capability flags the backend handshake cares about
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested from a backend.
    ///
    /// CLIENT_DEPRECATE_EOF stays off: the response reassembler relies on the EOF markers
    /// that close field definitions and rows.
    pub const BACKEND_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}
