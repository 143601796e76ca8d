//! Reassembles framed backend messages into logical response events.
//!
//! A backend answers one command with either a single OK/ERR message or a result set:
//! header (field count), field definitions, EOF, rows, EOF. The assembler tracks where in
//! that sequence a connection is and classifies each incoming payload.

use bytes::Bytes;
use thiserror::Error;

use super::packet::{get_lenenc_int, is_eof_packet, is_err_packet, is_ok_packet};

/// One logical response event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Ok(Bytes),
    Error(Bytes),
    FieldsEnd {
        header: Bytes,
        fields: Vec<Bytes>,
        eof: Bytes,
    },
    Row(Bytes),
    RowEnd(Bytes),
}

impl ResponseEvent {
    /// Short label used for logging and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ResponseEvent::Ok(_) => "ok",
            ResponseEvent::Error(_) => "error",
            ResponseEvent::FieldsEnd { .. } => "fields_end",
            ResponseEvent::Row(_) => "row",
            ResponseEvent::RowEnd(_) => "row_end",
        }
    }
}

/// A message arrived in a state that cannot accept it
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("empty backend packet")]
    Empty,
    #[error("malformed result set header")]
    BadHeader,
    #[error("result set declared {expected} fields but sent {received}")]
    FieldCount { expected: u64, received: u64 },
}

#[derive(Debug, Default)]
enum ResultState {
    #[default]
    Init,
    /// Collecting field definitions
    Header {
        header: Bytes,
        expected: u64,
        fields: Vec<Bytes>,
    },
    /// Field EOF seen, rows follow
    FirstEof,
}

#[derive(Debug, Default)]
pub struct ResponseAssembler {
    state: ResultState,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial result set
    pub fn reset(&mut self) {
        self.state = ResultState::Init;
    }

    /// True between responses
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ResultState::Init)
    }

    /// Classify one payload.
    ///
    /// `Ok(None)` means the payload was buffered as part of a result-set header. On error the
    /// state is reset; the caller must treat the connection as broken.
    pub fn feed(&mut self, payload: Bytes) -> Result<Option<ResponseEvent>, AssembleError> {
        let result = self.step(payload);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn step(&mut self, payload: Bytes) -> Result<Option<ResponseEvent>, AssembleError> {
        if payload.is_empty() {
            return Err(AssembleError::Empty);
        }

        match std::mem::take(&mut self.state) {
            ResultState::Init => {
                // Only a fresh response can be OK; inside a result set 0x00 starts a row
                if is_ok_packet(&payload) {
                    return Ok(Some(ResponseEvent::Ok(payload)));
                }
                if is_err_packet(&payload) {
                    return Ok(Some(ResponseEvent::Error(payload)));
                }
                let mut buf = &payload[..];
                let expected = match get_lenenc_int(&mut buf) {
                    Some(n) if n > 0 => n,
                    _ => return Err(AssembleError::BadHeader),
                };
                self.state = ResultState::Header {
                    header: payload,
                    expected,
                    fields: Vec::with_capacity(expected.min(4096) as usize),
                };
                Ok(None)
            }
            ResultState::Header {
                header,
                expected,
                mut fields,
            } => {
                let received = fields.len() as u64;
                if is_err_packet(&payload) {
                    return Ok(Some(ResponseEvent::Error(payload)));
                }
                if is_eof_packet(&payload) {
                    if received != expected {
                        return Err(AssembleError::FieldCount { expected, received });
                    }
                    self.state = ResultState::FirstEof;
                    return Ok(Some(ResponseEvent::FieldsEnd {
                        header,
                        fields,
                        eof: payload,
                    }));
                }
                if received == expected {
                    return Err(AssembleError::FieldCount {
                        expected,
                        received: received + 1,
                    });
                }
                fields.push(payload);
                self.state = ResultState::Header {
                    header,
                    expected,
                    fields,
                };
                Ok(None)
            }
            ResultState::FirstEof => {
                if is_eof_packet(&payload) {
                    Ok(Some(ResponseEvent::RowEnd(payload)))
                } else if is_err_packet(&payload) {
                    Ok(Some(ResponseEvent::Error(payload)))
                } else {
                    self.state = ResultState::FirstEof;
                    Ok(Some(ResponseEvent::Row(payload)))
                }
            }
        }
    }
}
