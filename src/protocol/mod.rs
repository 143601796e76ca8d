pub mod assembler;
pub mod charset;
pub mod codec;
pub mod command;
pub mod error_code;
pub mod handshake;
pub mod packet;
pub mod response;

pub use assembler::{AssembleError, ResponseAssembler, ResponseEvent};
pub use codec::PacketCodec;
pub use handshake::{compute_auth_response, HandshakeResponse, InitialHandshake};
pub use packet::{capabilities, is_eof_packet, is_err_packet, is_ok_packet, write_frame, Packet};
pub use response::{ErrPacket, OkPacket};
