use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{peek_payload_len, Packet, MAX_PAYLOAD_SIZE};

/// Backend packet codec for use with tokio `Framed`
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_PAYLOAD_SIZE),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match peek_payload_len(src) {
            Some(len) if len > self.max_packet_size => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "packet of {} bytes exceeds max_packet_size {}",
                    len, self.max_packet_size
                ),
            )),
            Some(len) => {
                src.reserve(len.saturating_sub(src.len()));
                Ok(Packet::decode(src))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = PacketCodec::new(16);
        let mut buf = BytesMut::from(&[0x20, 0x00, 0x00, 0x01][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decodes_consecutive_frames() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        Packet::new(1, vec![0x01]).encode(&mut buf);
        Packet::new(2, vec![0x02, 0x03]).encode(&mut buf);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.sequence_id, 1);
        assert_eq!(&second.payload[..], &[0x02, 0x03]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
