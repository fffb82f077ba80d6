//! Fixed-layout binary wire protocol.
//!
//! Every frame is a 16-byte header followed by a body whose size is fixed by
//! the message type. All fields are big-endian:
//!
//! ```text
//! 0      4          8         12     14         16
//! +------+----------+---------+------+----------+------------------+
//! |length| sequence | session | type | reserved | body (per type)  |
//! +------+----------+---------+------+----------+------------------+
//! ```
//!
//! Decoding never interprets a frame whose declared length differs from the
//! exact size of its type; such frames are rejected with a [`ProtocolError`].

use arrayvec::ArrayString;
use heapless::Vec as FixedVec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const HEADER_LEN: usize = 16;
pub const MAX_LICENSE_LEN: usize = 64;

pub const DOCK_QUERY_LEN: usize = HEADER_LEN + 4;
pub const DOCK_QUERY_RESPONSE_LEN: usize = HEADER_LEN + 4;
pub const DOCK_REQUEST_LEN: usize = HEADER_LEN + 4 + 4 + MAX_LICENSE_LEN;
pub const UNDOCK_REQUEST_LEN: usize = HEADER_LEN + 4;
pub const DOCK_RESPONSE_LEN: usize = HEADER_LEN + 4;
pub const UNDOCK_RESPONSE_LEN: usize = HEADER_LEN + 4 + 8;
pub const FEE_QUERY_LEN: usize = HEADER_LEN + 4;
pub const FEE_RESPONSE_LEN: usize = HEADER_LEN + 4 + 8;

/// Largest frame of any type.
pub const MAX_FRAME_LEN: usize = DOCK_REQUEST_LEN;

/// Per-connection buffer capacity. Holds one read chunk plus a partial frame.
pub const FRAME_BUFFER_CAPACITY: usize = 512;
pub const READ_CHUNK_LEN: usize = 256;

/// `dock_id` value meaning "no free dock".
pub const NO_DOCK: i32 = -1;
/// `fee` value meaning "no fee".
pub const NO_FEE: i64 = -1;

const_assert!(DOCK_REQUEST_LEN == 88);
const_assert!(UNDOCK_RESPONSE_LEN == 28);
const_assert!(READ_CHUNK_LEN + MAX_FRAME_LEN <= FRAME_BUFFER_CAPACITY);

pub type License = ArrayString<MAX_LICENSE_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageType {
    DockQuery = 0,
    DockQueryResponse = 1,
    DockRequest = 2,
    UndockRequest = 3,
    DockResponse = 4,
    UndockResponse = 5,
    FeeQuery = 6,
    FeeResponse = 7,
}

impl MessageType {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::DockQuery),
            1 => Some(Self::DockQueryResponse),
            2 => Some(Self::DockRequest),
            3 => Some(Self::UndockRequest),
            4 => Some(Self::DockResponse),
            5 => Some(Self::UndockResponse),
            6 => Some(Self::FeeQuery),
            7 => Some(Self::FeeResponse),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Exact size in bytes of a frame of this type, header included.
    pub fn wire_len(self) -> usize {
        match self {
            Self::DockQuery => DOCK_QUERY_LEN,
            Self::DockQueryResponse => DOCK_QUERY_RESPONSE_LEN,
            Self::DockRequest => DOCK_REQUEST_LEN,
            Self::UndockRequest => UNDOCK_REQUEST_LEN,
            Self::DockResponse => DOCK_RESPONSE_LEN,
            Self::UndockResponse => UNDOCK_RESPONSE_LEN,
            Self::FeeQuery => FEE_QUERY_LEN,
            Self::FeeResponse => FEE_RESPONSE_LEN,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::DockQuery | Self::DockRequest | Self::UndockRequest | Self::FeeQuery
        )
    }
}

/// Response status carried in dock, undock and fee responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Overweight = 2,
    Occupied = 3,
    NotDocked = 4,
    StoreFailure = 5,
}

impl Status {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::NotFound),
            2 => Some(Self::Overweight),
            3 => Some(Self::Occupied),
            4 => Some(Self::NotDocked),
            5 => Some(Self::StoreFailure),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::NotFound => "pad not found",
            Status::Overweight => "ship exceeds pad capacity",
            Status::Occupied => "pad occupied",
            Status::NotDocked => "no ship docked",
            Status::StoreFailure => "server failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub sequence: u32,
    pub session: u32,
    pub message_type: MessageType,
}

impl Header {
    /// Parses and validates a header. The declared length must equal the
    /// exact frame size of the declared type.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let mut reader = WireReader::new(&bytes[..HEADER_LEN]);
        let length = reader.u32()?;
        let sequence = reader.u32()?;
        let session = reader.u32()?;
        let code = reader.u16()?;
        let reserved = reader.u16()?;

        let message_type =
            MessageType::from_code(code).ok_or(ProtocolError::UnknownMessageType(code))?;
        if reserved != 0 {
            return Err(ProtocolError::ReservedNotZero(reserved));
        }
        let expected = message_type.wire_len();
        if length as usize != expected {
            return Err(ProtocolError::LengthMismatch {
                message_type,
                declared: length,
                expected,
            });
        }

        Ok(Self {
            length,
            sequence,
            session,
            message_type,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    DockQuery { weight: f32 },
    DockQueryResponse { dock_id: i32 },
    DockRequest { dock_id: i32, weight: f32, license: License },
    UndockRequest { dock_id: i32 },
    DockResponse { status: Status },
    UndockResponse { status: Status, fee: i64 },
    FeeQuery { dock_id: i32 },
    FeeResponse { status: Status, fee: i64 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::DockQuery { .. } => MessageType::DockQuery,
            Message::DockQueryResponse { .. } => MessageType::DockQueryResponse,
            Message::DockRequest { .. } => MessageType::DockRequest,
            Message::UndockRequest { .. } => MessageType::UndockRequest,
            Message::DockResponse { .. } => MessageType::DockResponse,
            Message::UndockResponse { .. } => MessageType::UndockResponse,
            Message::FeeQuery { .. } => MessageType::FeeQuery,
            Message::FeeResponse { .. } => MessageType::FeeResponse,
        }
    }
}

/// A header-stamped message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub sequence: u32,
    pub session: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(sequence: u32, session: u32, message: Message) -> Self {
        Self {
            sequence,
            session,
            message,
        }
    }

    pub fn wire_len(&self) -> usize {
        self.message.message_type().wire_len()
    }

    /// Encodes the full fixed-size frame.
    pub fn encode(&self) -> Vec<u8> {
        let message_type = self.message.message_type();
        let len = message_type.wire_len();
        let mut out = Vec::with_capacity(len);

        out.extend_from_slice(&(len as u32).to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.session.to_be_bytes());
        out.extend_from_slice(&message_type.code().to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());

        match &self.message {
            Message::DockQuery { weight } => out.extend_from_slice(&weight.to_be_bytes()),
            Message::DockQueryResponse { dock_id }
            | Message::UndockRequest { dock_id }
            | Message::FeeQuery { dock_id } => out.extend_from_slice(&dock_id.to_be_bytes()),
            Message::DockRequest {
                dock_id,
                weight,
                license,
            } => {
                out.extend_from_slice(&dock_id.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&encode_license(license));
            }
            Message::DockResponse { status } => {
                out.extend_from_slice(&status.code().to_be_bytes());
            }
            Message::UndockResponse { status, fee } | Message::FeeResponse { status, fee } => {
                out.extend_from_slice(&status.code().to_be_bytes());
                out.extend_from_slice(&fee.to_be_bytes());
            }
        }

        debug_assert_eq!(out.len(), len);
        out
    }

    /// Decodes exactly one frame. `bytes` must hold the whole frame and
    /// nothing else.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::decode(bytes)?;
        let expected = header.length as usize;
        if bytes.len() < expected {
            return Err(ProtocolError::Truncated {
                needed: expected,
                available: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(ProtocolError::LengthMismatch {
                message_type: header.message_type,
                declared: header.length,
                expected: bytes.len(),
            });
        }

        let mut body = WireReader::new(&bytes[HEADER_LEN..]);
        let message = match header.message_type {
            MessageType::DockQuery => Message::DockQuery {
                weight: checked_weight(body.f32()?)?,
            },
            MessageType::DockQueryResponse => Message::DockQueryResponse {
                dock_id: body.i32()?,
            },
            MessageType::DockRequest => Message::DockRequest {
                dock_id: body.i32()?,
                weight: checked_weight(body.f32()?)?,
                license: decode_license(body.take(MAX_LICENSE_LEN)?)?,
            },
            MessageType::UndockRequest => Message::UndockRequest {
                dock_id: body.i32()?,
            },
            MessageType::DockResponse => Message::DockResponse {
                status: body.status()?,
            },
            MessageType::UndockResponse => Message::UndockResponse {
                status: body.status()?,
                fee: body.i64()?,
            },
            MessageType::FeeQuery => Message::FeeQuery {
                dock_id: body.i32()?,
            },
            MessageType::FeeResponse => Message::FeeResponse {
                status: body.status()?,
                fee: body.i64()?,
            },
        };

        Ok(Self {
            sequence: header.sequence,
            session: header.session,
            message,
        })
    }
}

/// Builds a license, truncating at a char boundary to fit the wire field.
pub fn license_from_str(text: &str) -> License {
    let mut end = text.len().min(MAX_LICENSE_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut license = License::new();
    license.push_str(&text[..end]);
    license
}

fn encode_license(license: &License) -> [u8; MAX_LICENSE_LEN] {
    let mut field = [0u8; MAX_LICENSE_LEN];
    let bytes = license.as_bytes();
    field[..bytes.len()].copy_from_slice(bytes);
    field
}

fn decode_license(field: &[u8]) -> Result<License, ProtocolError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let text = core::str::from_utf8(&field[..end]).map_err(|_| ProtocolError::InvalidLicense)?;
    let text = text.trim_end_matches(' ');
    if text.is_empty() {
        return Err(ProtocolError::InvalidLicense);
    }
    License::from(text).map_err(|_| ProtocolError::InvalidLicense)
}

/// Widens a wire weight through its shortest decimal form, so `20.1f32`
/// becomes `20.1f64` and compares equal to a capacity entered as `20.1`.
pub fn weight_as_f64(weight: f32) -> f64 {
    weight
        .to_string()
        .parse()
        .unwrap_or_else(|_| f64::from(weight))
}

fn checked_weight(weight: f32) -> Result<f32, ProtocolError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(weight)
    } else {
        Err(ProtocolError::InvalidWeight(weight))
    }
}

struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(ProtocolError::Truncated {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    fn status(&mut self) -> Result<Status, ProtocolError> {
        let code = self.i32()?;
        Status::from_code(code).ok_or(ProtocolError::InvalidStatus(code))
    }
}

/// Accumulates bytes from a stream and yields complete frames.
///
/// Partial frames are kept until the rest arrives. A header that fails
/// validation is reported as soon as it is complete, before the body is read.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: FixedVec<u8, FRAME_BUFFER_CAPACITY>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: FixedVec::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.buf
            .extend_from_slice(bytes)
            .map_err(|()| ProtocolError::BufferOverflow)
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = Header::decode(&self.buf[..HEADER_LEN])?;
        let total = header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = Frame::decode(&self.buf[..total])?;
        self.consume(total);
        Ok(Some(frame))
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn consume(&mut self, n: usize) {
        let remaining = self.buf.len() - n;
        self.buf.rotate_left(n);
        self.buf.truncate(remaining);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("reserved header field is {0:#06x}, expected zero")]
    ReservedNotZero(u16),
    #[error("{message_type:?} declares {declared} bytes, expected {expected}")]
    LengthMismatch {
        message_type: MessageType,
        declared: u32,
        expected: usize,
    },
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),
    #[error("invalid weight {0}")]
    InvalidWeight(f32),
    #[error("license is empty or not valid UTF-8")]
    InvalidLicense,
    #[error("unknown status code {0}")]
    InvalidStatus(i32),
    #[error("frame buffer overflow")]
    BufferOverflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn license_truncates_on_char_boundary() {
        let text = "é".repeat(40);
        let license = license_from_str(&text);
        assert_eq!(license.len(), 64);
        assert!(license.chars().all(|c| c == 'é'));
    }

    #[test]
    fn weight_widens_to_shortest_decimal() {
        assert_eq!(weight_as_f64(20.1), 20.1);
        assert_eq!(weight_as_f64(33.3), 33.3);
        assert_eq!(weight_as_f64(0.0), 0.0);
        assert_eq!(weight_as_f64(f32::MAX), f64::from(f32::MAX));
        assert!(f64::from(20.1f32) > 20.1);
    }

    #[test]
    fn license_field_strips_padding() {
        let mut field = [b' '; MAX_LICENSE_LEN];
        field[..5].copy_from_slice(b"NX-01");
        assert_eq!(decode_license(&field).unwrap().as_str(), "NX-01");

        let mut field = [0u8; MAX_LICENSE_LEN];
        field[..3].copy_from_slice(b"abc");
        assert_eq!(decode_license(&field).unwrap().as_str(), "abc");

        assert_eq!(
            decode_license(&[0u8; MAX_LICENSE_LEN]),
            Err(ProtocolError::InvalidLicense)
        );
    }
}
