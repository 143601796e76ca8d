//! Client side of the backend authentication exchange

use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet};

const NATIVE_PASSWORD: &str = "mysql_native_password";

/// Initial handshake sent by a backend right after accept
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    /// Backend thread id, the target of `KILL`
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub scramble: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Parse a protocol-10 handshake payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        if buf.remaining() < 1 {
            return None;
        }
        let protocol_version = buf.get_u8();

        let server_version = take_cstr(&mut buf)?;

        if buf.remaining() < 4 + 8 + 1 + 2 {
            return None;
        }
        let connection_id = buf.get_u32_le();
        let mut scramble = buf[..8].to_vec();
        buf.advance(8);
        buf.advance(1);
        let mut capability_flags = buf.get_u16_le() as u32;

        let mut character_set = 0;
        let mut status_flags = 0;
        let mut auth_plugin_name = NATIVE_PASSWORD.to_string();

        // Pre-4.1 servers stop here
        if buf.remaining() >= 1 + 2 + 2 + 1 + 10 {
            character_set = buf.get_u8();
            status_flags = buf.get_u16_le();
            capability_flags |= (buf.get_u16_le() as u32) << 16;
            let scramble_len = buf.get_u8() as usize;
            buf.advance(10);

            if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
                let len = std::cmp::max(13, scramble_len.saturating_sub(8)).min(buf.remaining());
                let part = &buf[..len];
                let end = part.iter().position(|&b| b == 0).unwrap_or(len);
                scramble.extend_from_slice(&part[..end]);
                buf.advance(len);
            }

            if capability_flags & CLIENT_PLUGIN_AUTH != 0 && buf.has_remaining() {
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                auth_plugin_name = String::from_utf8_lossy(&buf[..end]).to_string();
            }
        }

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            scramble,
            auth_plugin_name,
        })
    }
}

/// Handshake response we send back to a backend
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
}

impl HandshakeResponse {
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(64 + self.username.len());

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.put_bytes(0, 23);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(db) = &self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(NATIVE_PASSWORD.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// mysql_native_password: SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn take_cstr(buf: &mut &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[..end]).to_string();
    buf.advance(end + 1);
    Some(s)
}
