//! Typed frames over the LWP header, with builders for every request the
//! client issues and a streaming parser for inbound bytes.

use bytes::{BufMut, Bytes, BytesMut};
use lwp_core::{Result, WireError, LWP_HEADER_SIZE, PROTOCOL_VERSION};

use crate::header::{
    ErrorPayload, FrameFlags, HelloAckPayload, HelloPayload, LwpHeader, Opcode,
};

/// One frame on the wire: header fields plus the undecoded payload.
///
/// The payload stays as raw `Bytes` at this layer so fetch data can be
/// sliced without copying; TLV decoding happens in the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub flags: FrameFlags,
    pub correlation_id: u64,
    pub topic_id: u32,
    pub offset: u64,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(opcode: Opcode, correlation_id: u64) -> Self {
        Self {
            opcode,
            flags: FrameFlags::NONE,
            correlation_id,
            topic_id: 0,
            offset: 0,
            payload: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic_id: u32) -> Self {
        self.topic_id = topic_id;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.flags.contains(FrameFlags::RESPONSE)
    }

    #[inline]
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(FrameFlags::COMPRESSED)
    }

    // ----- connection-level builders -----

    /// Client HELLO carrying protocol version and capabilities.
    #[must_use]
    pub fn hello(correlation_id: u64, capabilities: u32) -> Self {
        let payload = HelloPayload {
            version: PROTOCOL_VERSION,
            capabilities,
        };
        Self::new(Opcode::Hello, correlation_id).with_payload(payload.encode())
    }

    /// Server HELLO_ACK (built here for the in-process broker used in tests).
    #[must_use]
    pub fn hello_ack(correlation_id: u64, max_payload_len: u32) -> Self {
        let payload = HelloAckPayload {
            version: PROTOCOL_VERSION,
            max_payload_len,
        };
        Self::new(Opcode::HelloAck, correlation_id)
            .with_flags(FrameFlags::RESPONSE)
            .with_payload(payload.encode())
    }

    #[must_use]
    pub fn ping(correlation_id: u64) -> Self {
        Self::new(Opcode::Ping, correlation_id).with_flags(FrameFlags::KEEPALIVE)
    }

    #[must_use]
    pub fn pong(correlation_id: u64) -> Self {
        Self::new(Opcode::Pong, correlation_id)
            .with_flags(FrameFlags::KEEPALIVE | FrameFlags::RESPONSE)
    }

    #[must_use]
    pub fn backpressure() -> Self {
        Self::new(Opcode::Backpressure, 0).with_flags(FrameFlags::BACKPRESSURE)
    }

    #[must_use]
    pub fn resume() -> Self {
        Self::new(Opcode::Resume, 0)
    }

    // ----- produce / fetch builders -----

    /// PRODUCE frame carrying a TLV payload for one topic.
    #[must_use]
    pub fn produce(
        correlation_id: u64,
        topic_id: u32,
        payload: Bytes,
        compressed: bool,
    ) -> Self {
        let mut flags = FrameFlags::ACK_REQUESTED;
        if compressed {
            flags = flags | FrameFlags::COMPRESSED;
        }
        Self::new(Opcode::Produce, correlation_id)
            .with_flags(flags)
            .with_topic(topic_id)
            .with_payload(payload)
    }

    /// PRODUCE_ACK: `offset` is the byte offset the batch landed at.
    #[must_use]
    pub fn produce_ack(correlation_id: u64, topic_id: u32, offset: u64) -> Self {
        Self::new(Opcode::ProduceAck, correlation_id)
            .with_flags(FrameFlags::RESPONSE)
            .with_topic(topic_id)
            .with_offset(offset)
    }

    /// FETCH request: start offset rides in the header, payload is the
    /// 4-byte `max_bytes` budget.
    #[must_use]
    pub fn fetch(correlation_id: u64, topic_id: u32, start_offset: u64, max_bytes: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32_le(max_bytes);
        Self::new(Opcode::Fetch, correlation_id)
            .with_topic(topic_id)
            .with_offset(start_offset)
            .with_payload(payload.freeze())
    }

    #[must_use]
    pub fn fetch_resp(correlation_id: u64, topic_id: u32, body: &FetchResponse) -> Self {
        Self::new(Opcode::FetchResp, correlation_id)
            .with_flags(FrameFlags::RESPONSE)
            .with_topic(topic_id)
            .with_offset(body.start_offset)
            .with_payload(body.encode())
    }

    /// SEEK_END request: empty payload, topic in the header. The response
    /// echoes the opcode with RESPONSE set and the tail offset in `offset`.
    #[must_use]
    pub fn seek_end(correlation_id: u64, topic_id: u32) -> Self {
        Self::new(Opcode::SeekEnd, correlation_id).with_topic(topic_id)
    }

    // ----- subscription builders -----

    /// SUBSCRIBE: start offset in the header, payload is
    /// `max_batch_bytes: u32` + `consumer_id: u64`.
    #[must_use]
    pub fn subscribe(
        correlation_id: u64,
        topic_id: u32,
        start_offset: u64,
        max_batch_bytes: u32,
        consumer_id: u64,
    ) -> Self {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32_le(max_batch_bytes);
        payload.put_u64_le(consumer_id);
        Self::new(Opcode::Subscribe, correlation_id)
            .with_topic(topic_id)
            .with_offset(start_offset)
            .with_payload(payload.freeze())
    }

    /// UNSUBSCRIBE: payload is the `consumer_id: u64`.
    #[must_use]
    pub fn unsubscribe(correlation_id: u64, topic_id: u32, consumer_id: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64_le(consumer_id);
        Self::new(Opcode::Unsubscribe, correlation_id)
            .with_topic(topic_id)
            .with_payload(payload.freeze())
    }

    /// COMMIT: offset to commit rides in the header, payload is the
    /// `consumer_id: u64`.
    #[must_use]
    pub fn commit(correlation_id: u64, topic_id: u32, consumer_id: u64, offset: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64_le(consumer_id);
        Self::new(Opcode::Commit, correlation_id)
            .with_topic(topic_id)
            .with_offset(offset)
            .with_payload(payload.freeze())
    }

    // ----- topic management builders -----

    #[must_use]
    pub fn create_topic(correlation_id: u64, name: &str) -> Self {
        Self::new(Opcode::CreateTopic, correlation_id)
            .with_payload(Bytes::copy_from_slice(name.as_bytes()))
    }

    #[must_use]
    pub fn delete_topic(correlation_id: u64, topic_id: u32) -> Self {
        Self::new(Opcode::DeleteTopic, correlation_id).with_topic(topic_id)
    }

    #[must_use]
    pub fn list_topics(correlation_id: u64) -> Self {
        Self::new(Opcode::ListTopics, correlation_id)
    }

    #[must_use]
    pub fn get_topic(correlation_id: u64, topic_id: u32) -> Self {
        Self::new(Opcode::GetTopic, correlation_id).with_topic(topic_id)
    }

    /// SET_RETENTION payload: `max_age_secs: u64` + `max_bytes: u64`
    /// (zero disables the respective limit).
    #[must_use]
    pub fn set_retention(
        correlation_id: u64,
        topic_id: u32,
        max_age_secs: u64,
        max_bytes: u64,
    ) -> Self {
        let mut payload = BytesMut::with_capacity(16);
        payload.put_u64_le(max_age_secs);
        payload.put_u64_le(max_bytes);
        Self::new(Opcode::SetRetention, correlation_id)
            .with_topic(topic_id)
            .with_payload(payload.freeze())
    }

    // ----- error builder -----

    #[must_use]
    pub fn error(correlation_id: u64, payload: &ErrorPayload) -> Self {
        Self::new(Opcode::Error, correlation_id)
            .with_flags(FrameFlags::RESPONSE)
            .with_payload(payload.encode())
    }
}

/// FETCH_RESP payload: a 24-byte offset prefix followed by TLV data.
///
/// `tail_offset` is the topic's high-water mark; `lag()` is the distance
/// between it and the end of the returned window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub start_offset: u64,
    pub end_offset: u64,
    pub tail_offset: u64,
    pub data: Bytes,
}

impl FetchResponse {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24 + self.data.len());
        buf.put_u64_le(self.start_offset);
        buf.put_u64_le(self.end_offset);
        buf.put_u64_le(self.tail_offset);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.len() < 24 {
            return Err(WireError::BufferTooSmall {
                required: 24,
                available: payload.len(),
            });
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&payload[0..8]);
        let start_offset = u64::from_le_bytes(b);
        b.copy_from_slice(&payload[8..16]);
        let end_offset = u64::from_le_bytes(b);
        b.copy_from_slice(&payload[16..24]);
        let tail_offset = u64::from_le_bytes(b);
        Ok(Self {
            start_offset,
            end_offset,
            tail_offset,
            data: payload.slice(24..),
        })
    }

    /// Bytes between the end of this window and the topic tail.
    #[must_use]
    pub fn lag(&self) -> u64 {
        self.tail_offset.saturating_sub(self.end_offset)
    }
}

/// Serialize a frame (header + payload) into one buffer.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Bytes {
    let header = LwpHeader {
        opcode: frame.opcode,
        flags: frame.flags,
        correlation_id: frame.correlation_id,
        topic_id: frame.topic_id,
        offset: frame.offset,
        payload_len: frame.payload.len() as u32,
    };
    let mut buf = BytesMut::with_capacity(LWP_HEADER_SIZE + frame.payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(&frame.payload);
    buf.freeze()
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
/// otherwise the frame and the number of bytes consumed. An oversized
/// `payload_len` fails here, before the payload arrives.
pub fn parse_frame(buf: &[u8], payload_cap: u32) -> Result<Option<(Frame, usize)>> {
    if buf.len() < LWP_HEADER_SIZE {
        return Ok(None);
    }

    let header = LwpHeader::parse(buf, payload_cap)?;
    let total = LWP_HEADER_SIZE + header.payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let payload = if header.payload_len > 0 {
        Bytes::copy_from_slice(&buf[LWP_HEADER_SIZE..total])
    } else {
        Bytes::new()
    };

    Ok(Some((
        Frame {
            opcode: header.opcode,
            flags: header.flags,
            correlation_id: header.correlation_id,
            topic_id: header.topic_id,
            offset: header.offset,
            payload,
        },
        total,
    )))
}
