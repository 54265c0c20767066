//! LWP fixed header and associated wire enums.
//!
//! Wire format (44 bytes, little-endian):
//!
//! ```text
//! Offset  Size  Field
//! 0       4     Magic ("LANC")
//! 4       1     Version
//! 5       1     Opcode
//! 6       2     Flags
//! 8       8     Correlation ID
//! 16      4     Topic ID
//! 20      8     Offset
//! 28      4     Payload Length
//! 32      8     Reserved (zero)
//! 40      4     Header CRC32C (of bytes 0-39)
//! ```

use std::ops::BitOr;

use bytes::{BufMut, Bytes, BytesMut};
use lwp_core::{crc32c, Result, WireError, LWP_HEADER_SIZE, LWP_MAGIC, PROTOCOL_VERSION};

/// Frame kinds on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Hello = 0x01,
    HelloAck = 0x02,
    Ping = 0x03,
    Pong = 0x04,

    Produce = 0x10,
    ProduceAck = 0x11,

    Fetch = 0x20,
    FetchResp = 0x21,
    Subscribe = 0x22,
    Unsubscribe = 0x23,
    Commit = 0x24,
    SeekEnd = 0x25,

    CreateTopic = 0x30,
    DeleteTopic = 0x31,
    ListTopics = 0x32,
    GetTopic = 0x33,
    SetRetention = 0x34,

    Backpressure = 0x40,
    Resume = 0x41,

    Error = 0xFE,
}

impl Opcode {
    /// The response opcode paired with this request opcode.
    ///
    /// Hello/Ping/Produce/Fetch have dedicated response opcodes; the
    /// remaining request kinds are answered with the same opcode carrying
    /// the RESPONSE flag. Every request may alternatively receive ERROR.
    #[must_use]
    pub fn response_of(self) -> Opcode {
        match self {
            Self::Hello => Self::HelloAck,
            Self::Ping => Self::Pong,
            Self::Produce => Self::ProduceAck,
            Self::Fetch => Self::FetchResp,
            other => other,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x03 => Ok(Self::Ping),
            0x04 => Ok(Self::Pong),
            0x10 => Ok(Self::Produce),
            0x11 => Ok(Self::ProduceAck),
            0x20 => Ok(Self::Fetch),
            0x21 => Ok(Self::FetchResp),
            0x22 => Ok(Self::Subscribe),
            0x23 => Ok(Self::Unsubscribe),
            0x24 => Ok(Self::Commit),
            0x25 => Ok(Self::SeekEnd),
            0x30 => Ok(Self::CreateTopic),
            0x31 => Ok(Self::DeleteTopic),
            0x32 => Ok(Self::ListTopics),
            0x33 => Ok(Self::GetTopic),
            0x34 => Ok(Self::SetRetention),
            0x40 => Ok(Self::Backpressure),
            0x41 => Ok(Self::Resume),
            0xFE => Ok(Self::Error),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

/// Header flag bits (u16 bitfield).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u16);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0x0000);
    /// Payload is LZ4-compressed as a whole.
    pub const COMPRESSED: FrameFlags = FrameFlags(0x0001);
    /// Frame is a response to a client request.
    pub const RESPONSE: FrameFlags = FrameFlags(0x0002);
    /// Producer requests a PRODUCE_ACK for this frame.
    pub const ACK_REQUESTED: FrameFlags = FrameFlags(0x0004);
    /// Server-initiated flow-control event.
    pub const BACKPRESSURE: FrameFlags = FrameFlags(0x0008);
    /// Heartbeat frame.
    pub const KEEPALIVE: FrameFlags = FrameFlags(0x0010);
    /// No further data follows on this stream.
    pub const END_OF_STREAM: FrameFlags = FrameFlags(0x0020);

    #[inline]
    #[must_use]
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Parsed LWP frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwpHeader {
    pub opcode: Opcode,
    pub flags: FrameFlags,
    pub correlation_id: u64,
    pub topic_id: u32,
    pub offset: u64,
    pub payload_len: u32,
}

impl LwpHeader {
    pub const SIZE: usize = LWP_HEADER_SIZE;

    /// Serialize this header to 44 bytes with a computed CRC.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&LWP_MAGIC);
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.opcode as u8;
        buf[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..16].copy_from_slice(&self.correlation_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.topic_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.payload_len.to_le_bytes());
        // bytes 32..40 stay zero (reserved)
        let crc = crc32c(&buf[0..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a 44-byte buffer into a header, enforcing `payload_cap`.
    ///
    /// # Errors
    /// `InvalidMagic`, `UnsupportedVersion`, `CrcMismatch`, `UnknownOpcode`
    /// or `PayloadTooLarge`. The cap is checked here so an oversized frame
    /// is rejected before any payload byte is read.
    pub fn parse(buf: &[u8], payload_cap: u32) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(WireError::BufferTooSmall {
                required: Self::SIZE,
                available: buf.len(),
            });
        }

        if buf[0..4] != LWP_MAGIC {
            return Err(WireError::InvalidMagic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(buf[4]));
        }

        let stored = u32::from_le_bytes([buf[40], buf[41], buf[42], buf[43]]);
        let computed = crc32c(&buf[0..40]);
        if stored != computed {
            return Err(WireError::CrcMismatch { stored, computed });
        }

        let opcode = Opcode::try_from(buf[5])?;
        let flags = FrameFlags(u16::from_le_bytes([buf[6], buf[7]]));
        let correlation_id = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let topic_id = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let offset = u64::from_le_bytes([
            buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
        ]);
        let payload_len = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);

        if payload_len > payload_cap {
            return Err(WireError::PayloadTooLarge {
                len: payload_len,
                cap: payload_cap,
            });
        }

        Ok(Self {
            opcode,
            flags,
            correlation_id,
            topic_id,
            offset,
            payload_len,
        })
    }

    #[inline]
    #[must_use]
    pub fn has_flag(&self, flag: FrameFlags) -> bool {
        self.flags.contains(flag)
    }
}

/// HELLO payload: client protocol version plus a capability bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloPayload {
    pub version: u8,
    pub capabilities: u32,
}

impl HelloPayload {
    /// Capability bit: the client can decode LZ4-compressed payloads.
    pub const CAP_LZ4: u32 = 0x0000_0001;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.version);
        buf.put_u32_le(self.capabilities);
        buf.freeze()
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(WireError::BufferTooSmall {
                required: 5,
                available: payload.len(),
            });
        }
        Ok(Self {
            version: payload[0],
            capabilities: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
        })
    }
}

/// HELLO_ACK payload: server version and the negotiated payload cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAckPayload {
    pub version: u8,
    pub max_payload_len: u32,
}

impl HelloAckPayload {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.version);
        buf.put_u32_le(self.max_payload_len);
        buf.freeze()
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(WireError::BufferTooSmall {
                required: 5,
                available: payload.len(),
            });
        }
        Ok(Self {
            version: payload[0],
            max_payload_len: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
        })
    }
}

/// Server error codes carried in ERROR frames. One-to-one with the broker's
/// wire definition.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    TopicNotFound = 0x0001,
    NotLeader = 0x0002,
    ServerCatchingUp = 0x0003,
    AccessDenied = 0x0004,
    InvalidArgument = 0x0005,
    Internal = 0x0006,
}

impl ServerErrorCode {
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::TopicNotFound),
            0x0002 => Some(Self::NotLeader),
            0x0003 => Some(Self::ServerCatchingUp),
            0x0004 => Some(Self::AccessDenied),
            0x0005 => Some(Self::InvalidArgument),
            0x0006 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// ERROR frame payload: `code: u16` followed by code-specific detail bytes.
///
/// NotLeader carries the leader address as UTF-8 `host:port`;
/// ServerCatchingUp carries the server offset as a `u64`; all other codes
/// carry a UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub detail: Bytes,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: ServerErrorCode, detail: impl Into<Bytes>) -> Self {
        Self {
            code: code as u16,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.detail.len());
        buf.put_u16_le(self.code);
        buf.put_slice(&self.detail);
        buf.freeze()
    }

    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.len() < 2 {
            return Err(WireError::BufferTooSmall {
                required: 2,
                available: payload.len(),
            });
        }
        Ok(Self {
            code: u16::from_le_bytes([payload[0], payload[1]]),
            detail: payload.slice(2..),
        })
    }

    /// The detail bytes as lossy UTF-8 (reason text or leader address).
    #[must_use]
    pub fn detail_text(&self) -> String {
        String::from_utf8_lossy(&self.detail).into_owned()
    }

    /// The detail bytes as a little-endian u64 (ServerCatchingUp offset).
    #[must_use]
    pub fn detail_u64(&self) -> Option<u64> {
        if self.detail.len() < 8 {
            return None;
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.detail[..8]);
        Some(u64::from_le_bytes(b))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lwp_core::MAX_PAYLOAD_LEN;

    fn sample_header() -> LwpHeader {
        LwpHeader {
            opcode: Opcode::Produce,
            flags: FrameFlags::ACK_REQUESTED,
            correlation_id: 42,
            topic_id: 7,
            offset: 0,
            payload_len: 14,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        let parsed = LwpHeader::parse(&encoded, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn reserved_bytes_are_zero() {
        let encoded = sample_header().encode();
        assert_eq!(&encoded[32..40], &[0u8; 8]);
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut encoded = sample_header().encode();
        encoded[0..4].copy_from_slice(b"JUNK");
        assert!(matches!(
            LwpHeader::parse(&encoded, MAX_PAYLOAD_LEN),
            Err(WireError::InvalidMagic)
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut encoded = sample_header().encode();
        encoded[4] = 9;
        assert!(matches!(
            LwpHeader::parse(&encoded, MAX_PAYLOAD_LEN),
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn every_single_bit_flip_in_crc_region_is_rejected() {
        let encoded = sample_header().encode();
        for byte in 0..40 {
            for bit in 0..8 {
                let mut corrupted = encoded;
                corrupted[byte] ^= 1 << bit;
                assert!(
                    LwpHeader::parse(&corrupted, MAX_PAYLOAD_LEN).is_err(),
                    "bit {} of byte {} survived",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn payload_cap_enforced_at_header_parse() {
        let mut header = sample_header();
        header.payload_len = MAX_PAYLOAD_LEN + 1;
        let encoded = header.encode();
        assert!(matches!(
            LwpHeader::parse(&encoded, MAX_PAYLOAD_LEN),
            Err(WireError::PayloadTooLarge { .. })
        ));
        // A smaller negotiated cap also applies.
        header.payload_len = 1024;
        let encoded = header.encode();
        assert!(LwpHeader::parse(&encoded, 512).is_err());
        assert!(LwpHeader::parse(&encoded, 2048).is_ok());
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut encoded = sample_header().encode();
        encoded[5] = 0x77;
        // Re-seal the CRC so the opcode check is what fires.
        let crc = lwp_core::crc32c(&encoded[0..40]);
        encoded[40..44].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            LwpHeader::parse(&encoded, MAX_PAYLOAD_LEN),
            Err(WireError::UnknownOpcode(0x77))
        ));
    }

    #[test]
    fn response_pairing() {
        assert_eq!(Opcode::Hello.response_of(), Opcode::HelloAck);
        assert_eq!(Opcode::Ping.response_of(), Opcode::Pong);
        assert_eq!(Opcode::Produce.response_of(), Opcode::ProduceAck);
        assert_eq!(Opcode::Fetch.response_of(), Opcode::FetchResp);
        assert_eq!(Opcode::SeekEnd.response_of(), Opcode::SeekEnd);
        assert_eq!(Opcode::ListTopics.response_of(), Opcode::ListTopics);
    }

    #[test]
    fn flags_bit_ops() {
        let flags = FrameFlags::COMPRESSED | FrameFlags::ACK_REQUESTED;
        assert!(flags.contains(FrameFlags::COMPRESSED));
        assert!(flags.contains(FrameFlags::ACK_REQUESTED));
        assert!(!flags.contains(FrameFlags::RESPONSE));
        assert_eq!(flags.bits(), 0x0005);
    }

    #[test]
    fn hello_payload_roundtrip() {
        let hello = HelloPayload {
            version: PROTOCOL_VERSION,
            capabilities: HelloPayload::CAP_LZ4,
        };
        let parsed = HelloPayload::parse(&hello.encode()).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn hello_ack_payload_roundtrip() {
        let ack = HelloAckPayload {
            version: PROTOCOL_VERSION,
            max_payload_len: 4 * 1024 * 1024,
        };
        let parsed = HelloAckPayload::parse(&ack.encode()).unwrap();
        assert_eq!(parsed, ack);
    }

    #[test]
    fn error_payload_roundtrip() {
        let err = ErrorPayload::new(ServerErrorCode::NotLeader, &b"10.0.10.12:1992"[..]);
        let parsed = ErrorPayload::parse(&err.encode()).unwrap();
        assert_eq!(parsed.code, ServerErrorCode::NotLeader as u16);
        assert_eq!(parsed.detail_text(), "10.0.10.12:1992");
    }

    #[test]
    fn error_payload_u64_detail() {
        let err = ErrorPayload::new(
            ServerErrorCode::ServerCatchingUp,
            Bytes::copy_from_slice(&123_456u64.to_le_bytes()),
        );
        let parsed = ErrorPayload::parse(&err.encode()).unwrap();
        assert_eq!(parsed.detail_u64(), Some(123_456));
    }
}
