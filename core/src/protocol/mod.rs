//! # Wire Protocol
//!
//! Two layers, both pure and shared by the broker and the client crate:
//!
//! - [`frame`] - length-prefixed message payloads with a size limit
//! - [`packet`] - typed packets inside a transport frame, exposed as a
//!   `tokio_util` codec for use with `Framed`
//!
//! ## Handshake
//!
//! A client opens with `Hello{role, client_id}`. The broker answers
//! `Welcome{connection_id, max_message_size, max_retries}` or
//! `Rejected{reason}` and closes. Every later request gets exactly one reply,
//! in order.

pub mod frame;
pub mod packet;

pub use frame::{CodecError, FrameCodec, LENGTH_PREFIX_SIZE};
pub use packet::{
    ErrorCode, Packet, PacketCodec, QueueCounts, RejectReason, Role, ENVELOPE_HEADROOM,
    MAX_IDS_PER_PACKET, MAX_ID_LEN,
};
