//! Packet layer carried over a transport frame.
//!
//! Transport frame: `[u32 BE body length][u8 packet type][fields...]`.
//! Strings are `u16`-length prefixed UTF-8, integers are big-endian and
//! message payloads are embedded as a [`FrameCodec`] frame so that the
//! payload limit is checked on the payload itself.

use super::frame::{CodecError, FrameCodec, LENGTH_PREFIX_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

/// Room for packet fields around the largest allowed payload.
pub const ENVELOPE_HEADROOM: usize = 64 * 1024;
/// Longest message id or client id, in bytes.
pub const MAX_ID_LEN: usize = 255;
/// Most ids carried by a single `Failed`, `EraseFailed` or `Erased` packet.
pub const MAX_IDS_PER_PACKET: usize = 200;
/// Longest error message; longer ones are cut on a char boundary.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Connection role announced in `Hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Producer,
    Consumer,
    Monitor,
}

impl Role {
    fn to_wire(self) -> u8 {
        match self {
            Role::Producer => 1,
            Role::Consumer => 2,
            Role::Monitor => 3,
        }
    }

    fn from_wire(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Role::Producer),
            2 => Ok(Role::Consumer),
            3 => Ok(Role::Monitor),
            other => Err(CodecError::malformed(format!("unknown role {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
            Role::Monitor => write!(f, "monitor"),
        }
    }
}

/// Why the broker refused a connection during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdmissionLimit,
    ShuttingDown,
}

impl RejectReason {
    fn to_wire(self) -> u8 {
        match self {
            RejectReason::AdmissionLimit => 1,
            RejectReason::ShuttingDown => 2,
        }
    }

    fn from_wire(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(RejectReason::AdmissionLimit),
            2 => Ok(RejectReason::ShuttingDown),
            other => Err(CodecError::malformed(format!(
                "unknown reject reason {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AdmissionLimit => write!(f, "admission limit reached"),
            RejectReason::ShuttingDown => write!(f, "broker shutting down"),
        }
    }
}

/// Error codes carried by `Error` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 1,
    InvalidPriority = 2,
    DuplicateMessage = 3,
    QueueFull = 4,
    UnknownMessage = 5,
    InvalidToken = 6,
    InvalidState = 7,
    RoleViolation = 8,
    MessageTooLarge = 9,
    InvalidMessage = 10,
    ShuttingDown = 11,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            2 => ErrorCode::InvalidPriority,
            3 => ErrorCode::DuplicateMessage,
            4 => ErrorCode::QueueFull,
            5 => ErrorCode::UnknownMessage,
            6 => ErrorCode::InvalidToken,
            7 => ErrorCode::InvalidState,
            8 => ErrorCode::RoleViolation,
            9 => ErrorCode::MessageTooLarge,
            10 => ErrorCode::InvalidMessage,
            11 => ErrorCode::ShuttingDown,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Snapshot of queue occupancy reported to monitors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub capacity: u64,
    pub active: u64,
    pub failed: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    // Client -> broker
    Hello {
        role: Role,
        client_id: String,
    },
    Push {
        id: String,
        priority: u8,
        delay_ms: u32,
        payload: Bytes,
    },
    Pop {
        wait_ms: u32,
    },
    Ack {
        id: String,
        token: u64,
        requeue: bool,
        delay_ms: u32,
    },
    /// `Ack` then `Pop` in one round trip; answered like `Pop`.
    AckPop {
        id: String,
        token: u64,
        requeue: bool,
        delay_ms: u32,
        wait_ms: u32,
    },
    Count,
    ListFailed {
        limit: u32,
    },
    EraseFailed {
        ids: Vec<String>,
    },
    Goodbye,

    // Broker -> client
    Welcome {
        connection_id: u64,
        max_message_size: u32,
        max_retries: u32,
    },
    Rejected {
        reason: RejectReason,
    },
    Accepted {
        id: String,
    },
    Deliver {
        id: String,
        token: u64,
        attempt: u32,
        payload: Bytes,
    },
    Empty,
    Acked {
        id: String,
    },
    Counts(QueueCounts),
    Failed {
        ids: Vec<String>,
        truncated: bool,
    },
    Erased {
        ids: Vec<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

mod packet_type {
    pub const HELLO: u8 = 0x01;
    pub const PUSH: u8 = 0x02;
    pub const POP: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const COUNT: u8 = 0x05;
    pub const LIST_FAILED: u8 = 0x06;
    pub const ERASE_FAILED: u8 = 0x07;
    pub const GOODBYE: u8 = 0x08;
    pub const ACK_POP: u8 = 0x09;

    pub const WELCOME: u8 = 0x81;
    pub const REJECTED: u8 = 0x82;
    pub const ACCEPTED: u8 = 0x83;
    pub const DELIVER: u8 = 0x84;
    pub const EMPTY: u8 = 0x85;
    pub const ACKED: u8 = 0x86;
    pub const COUNTS: u8 = 0x87;
    pub const FAILED: u8 = 0x88;
    pub const ERASED: u8 = 0x89;
    pub const ERROR: u8 = 0x8A;
}

impl Packet {
    /// Build an `Error` packet, cutting overly long messages.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut cut = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Packet::Error { code, message }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => "Hello",
            Packet::Push { .. } => "Push",
            Packet::Pop { .. } => "Pop",
            Packet::Ack { .. } => "Ack",
            Packet::AckPop { .. } => "AckPop",
            Packet::Count => "Count",
            Packet::ListFailed { .. } => "ListFailed",
            Packet::EraseFailed { .. } => "EraseFailed",
            Packet::Goodbye => "Goodbye",
            Packet::Welcome { .. } => "Welcome",
            Packet::Rejected { .. } => "Rejected",
            Packet::Accepted { .. } => "Accepted",
            Packet::Deliver { .. } => "Deliver",
            Packet::Empty => "Empty",
            Packet::Acked { .. } => "Acked",
            Packet::Counts(_) => "Counts",
            Packet::Failed { .. } => "Failed",
            Packet::Erased { .. } => "Erased",
            Packet::Error { .. } => "Error",
        }
    }

    /// Packets only a client may send.
    pub fn is_client_packet(&self) -> bool {
        self.type_byte() & 0x80 == 0
    }

    fn type_byte(&self) -> u8 {
        use packet_type::*;
        match self {
            Packet::Hello { .. } => HELLO,
            Packet::Push { .. } => PUSH,
            Packet::Pop { .. } => POP,
            Packet::Ack { .. } => ACK,
            Packet::AckPop { .. } => ACK_POP,
            Packet::Count => COUNT,
            Packet::ListFailed { .. } => LIST_FAILED,
            Packet::EraseFailed { .. } => ERASE_FAILED,
            Packet::Goodbye => GOODBYE,
            Packet::Welcome { .. } => WELCOME,
            Packet::Rejected { .. } => REJECTED,
            Packet::Accepted { .. } => ACCEPTED,
            Packet::Deliver { .. } => DELIVER,
            Packet::Empty => EMPTY,
            Packet::Acked { .. } => ACKED,
            Packet::Counts(_) => COUNTS,
            Packet::Failed { .. } => FAILED,
            Packet::Erased { .. } => ERASED,
            Packet::Error { .. } => ERROR,
        }
    }
}

/// `tokio_util` codec turning a byte stream into [`Packet`]s.
///
/// Outgoing payloads are held to the message limit. Incoming payloads are
/// only held to the frame ceiling, so a well-formed packet carrying an
/// oversize payload still decodes and the receiver can refuse it with a
/// reply instead of losing the connection; see [`PacketCodec::validate`].
#[derive(Debug, Clone)]
pub struct PacketCodec {
    frame: FrameCodec,
    envelope: FrameCodec,
}

impl PacketCodec {
    pub fn new(max_message_size: usize) -> Self {
        let frame = FrameCodec::new(max_message_size);
        let envelope =
            FrameCodec::new(frame.max_message_size().saturating_add(ENVELOPE_HEADROOM));
        Self { frame, envelope }
    }

    pub fn max_message_size(&self) -> usize {
        self.frame.max_message_size()
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        *self = Self::new(max_message_size);
    }

    /// Largest transport frame body accepted or produced.
    pub fn max_frame_size(&self) -> usize {
        self.frame.max_message_size().saturating_add(ENVELOPE_HEADROOM)
    }

    /// Check every field without writing anything.
    pub fn validate(&self, packet: &Packet) -> Result<(), CodecError> {
        match packet {
            Packet::Hello { client_id, .. } => check_id("client id", client_id, true),
            Packet::Push { id, payload, .. } | Packet::Deliver { id, payload, .. } => {
                check_id("message id", id, false)?;
                self.frame.check_size(payload.len())
            }
            Packet::Ack { id, .. }
            | Packet::AckPop { id, .. }
            | Packet::Accepted { id }
            | Packet::Acked { id } => {
                check_id("message id", id, false)
            }
            Packet::EraseFailed { ids }
            | Packet::Erased { ids }
            | Packet::Failed { ids, .. } => {
                if ids.len() > MAX_IDS_PER_PACKET {
                    return Err(CodecError::malformed(format!(
                        "{} ids exceed the per-packet limit of {}",
                        ids.len(),
                        MAX_IDS_PER_PACKET
                    )));
                }
                ids.iter().try_for_each(|id| check_id("message id", id, false))
            }
            Packet::Error { message, .. } => {
                if message.len() > MAX_ERROR_MESSAGE_LEN {
                    return Err(CodecError::malformed("error message too long"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn write_body(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_u8(packet.type_byte());
        match packet {
            Packet::Hello { role, client_id } => {
                dst.put_u8(role.to_wire());
                put_str(dst, client_id);
            }
            Packet::Push {
                id,
                priority,
                delay_ms,
                payload,
            } => {
                put_str(dst, id);
                dst.put_u8(*priority);
                dst.put_u32(*delay_ms);
                self.frame.encode_into(payload, dst)?;
            }
            Packet::Pop { wait_ms } => dst.put_u32(*wait_ms),
            Packet::Ack {
                id,
                token,
                requeue,
                delay_ms,
            } => {
                put_str(dst, id);
                dst.put_u64(*token);
                dst.put_u8(u8::from(*requeue));
                dst.put_u32(*delay_ms);
            }
            Packet::AckPop {
                id,
                token,
                requeue,
                delay_ms,
                wait_ms,
            } => {
                put_str(dst, id);
                dst.put_u64(*token);
                dst.put_u8(u8::from(*requeue));
                dst.put_u32(*delay_ms);
                dst.put_u32(*wait_ms);
            }
            Packet::ListFailed { limit } => dst.put_u32(*limit),
            Packet::EraseFailed { ids } | Packet::Erased { ids } => put_ids(dst, ids),
            Packet::Welcome {
                connection_id,
                max_message_size,
                max_retries,
            } => {
                dst.put_u64(*connection_id);
                dst.put_u32(*max_message_size);
                dst.put_u32(*max_retries);
            }
            Packet::Rejected { reason } => dst.put_u8(reason.to_wire()),
            Packet::Accepted { id } | Packet::Acked { id } => put_str(dst, id),
            Packet::Deliver {
                id,
                token,
                attempt,
                payload,
            } => {
                put_str(dst, id);
                dst.put_u64(*token);
                dst.put_u32(*attempt);
                self.frame.encode_into(payload, dst)?;
            }
            Packet::Counts(counts) => {
                dst.put_u64(counts.capacity);
                dst.put_u64(counts.active);
                dst.put_u64(counts.failed);
                dst.put_u64(counts.free);
            }
            Packet::Failed { ids, truncated } => {
                put_ids(dst, ids);
                dst.put_u8(u8::from(*truncated));
            }
            Packet::Error { code, message } => {
                dst.put_u16(code.as_u16());
                put_str(dst, message);
            }
            Packet::Count | Packet::Goodbye | Packet::Empty => {}
        }
        Ok(())
    }

    /// Decode one packet body (the bytes after the transport length).
    pub fn decode_body(&self, body: Bytes) -> Result<Packet, CodecError> {
        use packet_type::*;
        let mut src = Cursor::new(&body[..]);
        let type_byte = get_u8(&mut src, "packet type")?;
        let packet = match type_byte {
            HELLO => Packet::Hello {
                role: Role::from_wire(get_u8(&mut src, "role")?)?,
                client_id: get_id(&mut src, "client id", true)?,
            },
            PUSH => Packet::Push {
                id: get_id(&mut src, "message id", false)?,
                priority: get_u8(&mut src, "priority")?,
                delay_ms: get_u32(&mut src, "delay")?,
                payload: self.envelope.decode_from(&mut src)?,
            },
            POP => Packet::Pop {
                wait_ms: get_u32(&mut src, "wait")?,
            },
            ACK => Packet::Ack {
                id: get_id(&mut src, "message id", false)?,
                token: get_u64(&mut src, "token")?,
                requeue: get_bool(&mut src, "requeue")?,
                delay_ms: get_u32(&mut src, "delay")?,
            },
            ACK_POP => Packet::AckPop {
                id: get_id(&mut src, "message id", false)?,
                token: get_u64(&mut src, "token")?,
                requeue: get_bool(&mut src, "requeue")?,
                delay_ms: get_u32(&mut src, "delay")?,
                wait_ms: get_u32(&mut src, "wait")?,
            },
            COUNT => Packet::Count,
            LIST_FAILED => Packet::ListFailed {
                limit: get_u32(&mut src, "limit")?,
            },
            ERASE_FAILED => Packet::EraseFailed {
                ids: get_ids(&mut src)?,
            },
            GOODBYE => Packet::Goodbye,
            WELCOME => Packet::Welcome {
                connection_id: get_u64(&mut src, "connection id")?,
                max_message_size: get_u32(&mut src, "max message size")?,
                max_retries: get_u32(&mut src, "max retries")?,
            },
            REJECTED => Packet::Rejected {
                reason: RejectReason::from_wire(get_u8(&mut src, "reason")?)?,
            },
            ACCEPTED => Packet::Accepted {
                id: get_id(&mut src, "message id", false)?,
            },
            DELIVER => Packet::Deliver {
                id: get_id(&mut src, "message id", false)?,
                token: get_u64(&mut src, "token")?,
                attempt: get_u32(&mut src, "attempt")?,
                payload: self.envelope.decode_from(&mut src)?,
            },
            EMPTY => Packet::Empty,
            ACKED => Packet::Acked {
                id: get_id(&mut src, "message id", false)?,
            },
            COUNTS => Packet::Counts(QueueCounts {
                capacity: get_u64(&mut src, "capacity")?,
                active: get_u64(&mut src, "active")?,
                failed: get_u64(&mut src, "failed")?,
                free: get_u64(&mut src, "free")?,
            }),
            FAILED => Packet::Failed {
                ids: get_ids(&mut src)?,
                truncated: get_bool(&mut src, "truncated")?,
            },
            ERASED => Packet::Erased {
                ids: get_ids(&mut src)?,
            },
            ERROR => Packet::Error {
                code: ErrorCode::from(get_u16(&mut src, "error code")?),
                message: get_str(&mut src, "error message")?,
            },
            other => {
                return Err(CodecError::malformed(format!(
                    "unknown packet type 0x{:02x}",
                    other
                )))
            }
        };
        if src.has_remaining() {
            return Err(CodecError::malformed(format!(
                "{} trailing bytes after {}",
                src.remaining(),
                packet.kind()
            )));
        }
        Ok(packet)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let body_len = {
            let mut peek = Cursor::new(&src[..LENGTH_PREFIX_SIZE]);
            peek.get_u32() as usize
        };
        if body_len > self.max_frame_size() {
            return Err(CodecError::malformed(format!(
                "frame of {} bytes exceeds limit {}",
                body_len,
                self.max_frame_size()
            )));
        }
        if src.len() < LENGTH_PREFIX_SIZE + body_len {
            src.reserve(LENGTH_PREFIX_SIZE + body_len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(body_len).freeze();
        self.decode_body(body).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.validate(&packet)?;

        let start = dst.len();
        dst.put_u32(0);
        if let Err(e) = self.write_body(&packet, dst) {
            dst.truncate(start);
            return Err(e);
        }
        let body_len = dst.len() - start - LENGTH_PREFIX_SIZE;
        if body_len > self.max_frame_size() {
            dst.truncate(start);
            return Err(CodecError::Oversize {
                size: body_len,
                max_size: self.max_frame_size(),
            });
        }
        (&mut dst[start..start + LENGTH_PREFIX_SIZE]).put_u32(body_len as u32);
        Ok(())
    }
}

fn check_id(what: &str, id: &str, allow_empty: bool) -> Result<(), CodecError> {
    if id.is_empty() && !allow_empty {
        return Err(CodecError::malformed(format!("{} is empty", what)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CodecError::malformed(format!(
            "{} of {} bytes exceeds {}",
            what,
            id.len(),
            MAX_ID_LEN
        )));
    }
    Ok(())
}

fn put_str(dst: &mut BytesMut, value: &str) {
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

fn put_ids(dst: &mut BytesMut, ids: &[String]) {
    dst.put_u16(ids.len() as u16);
    for id in ids {
        put_str(dst, id);
    }
}

fn need(src: &Cursor<&[u8]>, len: usize, what: &str) -> Result<(), CodecError> {
    if src.remaining() < len {
        return Err(CodecError::malformed(format!(
            "truncated {}: need {} bytes, {} available",
            what,
            len,
            src.remaining()
        )));
    }
    Ok(())
}

fn get_u8(src: &mut Cursor<&[u8]>, what: &str) -> Result<u8, CodecError> {
    need(src, 1, what)?;
    Ok(src.get_u8())
}

fn get_bool(src: &mut Cursor<&[u8]>, what: &str) -> Result<bool, CodecError> {
    match get_u8(src, what)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::malformed(format!(
            "invalid {} flag {}",
            what, other
        ))),
    }
}

fn get_u16(src: &mut Cursor<&[u8]>, what: &str) -> Result<u16, CodecError> {
    need(src, 2, what)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Cursor<&[u8]>, what: &str) -> Result<u32, CodecError> {
    need(src, 4, what)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut Cursor<&[u8]>, what: &str) -> Result<u64, CodecError> {
    need(src, 8, what)?;
    Ok(src.get_u64())
}

fn get_str(src: &mut Cursor<&[u8]>, what: &str) -> Result<String, CodecError> {
    let len = get_u16(src, what)? as usize;
    need(src, len, what)?;
    let mut raw = vec![0u8; len];
    src.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| CodecError::malformed(format!("{} is not UTF-8", what)))
}

fn get_id(src: &mut Cursor<&[u8]>, what: &str, allow_empty: bool) -> Result<String, CodecError> {
    let id = get_str(src, what)?;
    check_id(what, &id, allow_empty)?;
    Ok(id)
}

fn get_ids(src: &mut Cursor<&[u8]>) -> Result<Vec<String>, CodecError> {
    let count = get_u16(src, "id count")? as usize;
    if count > MAX_IDS_PER_PACKET {
        return Err(CodecError::malformed(format!(
            "{} ids exceed the per-packet limit of {}",
            count, MAX_IDS_PER_PACKET
        )));
    }
    (0..count)
        .map(|_| get_id(src, "message id", false))
        .collect()
}
