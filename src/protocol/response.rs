use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{get_lenenc_int, put_lenenc_int, ERR_HEADER, OK_HEADER};

/// Server status bit: autocommit is on
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// OK response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub message: Bytes,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        }
    }

    /// Protocol-41 payload, no frame header
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.message.len());
        buf.put_u8(OK_HEADER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(self.warnings);
        buf.extend_from_slice(&self.message);
        buf.freeze()
    }

    /// Parse a protocol-41 OK payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&OK_HEADER) {
            return None;
        }
        let mut buf = &payload[1..];
        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;
        let (status_flags, warnings) = if buf.remaining() >= 4 {
            (buf.get_u16_le(), buf.get_u16_le())
        } else {
            (0, 0)
        };
        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            message: Bytes::copy_from_slice(buf),
        })
    }
}

/// ERR response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.into(),
        }
    }

    /// Protocol-41 payload, no frame header
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.error_message.len());
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');
        let mut state = [b'0'; 5];
        for (dst, src) in state.iter_mut().zip(self.sql_state.bytes()) {
            *dst = src;
        }
        buf.extend_from_slice(&state);
        buf.extend_from_slice(self.error_message.as_bytes());
        buf.freeze()
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&ERR_HEADER) || payload.len() < 3 {
            return None;
        }
        let mut buf = &payload[1..];
        let error_code = buf.get_u16_le();

        let (sql_state, message) = if buf.first() == Some(&b'#') && buf.len() >= 6 {
            (String::from_utf8_lossy(&buf[1..6]).to_string(), &buf[6..])
        } else {
            ("HY000".to_string(), buf)
        };

        Some(Self {
            error_code,
            sql_state,
            error_message: String::from_utf8_lossy(message).to_string(),
        })
    }
}
