//! TLV (Type-Length-Value) record encoding for LWP payloads.
//!
//! Each record is packed as:
//!
//! ```text
//! +--------+----------+------------------+
//! | Type   | Length   | Value            |
//! | 1 byte | 4 bytes  | Length bytes     |
//! +--------+----------+------------------+
//! ```
//!
//! Length is little-endian. Records are packed contiguously with no
//! alignment or padding; a payload is valid iff successive records exactly
//! consume it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WireError, TLV_HEADER_SIZE};

/// Well-known TLV record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Opaque bytes.
    RawData = 0x01,
    /// UTF-8 JSON text.
    Json = 0x02,
    /// MessagePack bytes.
    MsgPack = 0x03,
    /// `key_len: u16` + key + value.
    KeyValue = 0x10,
    /// `timestamp_ns: u64` + value.
    Timestamped = 0x11,
    /// Empty tombstone.
    Null = 0xFF,
}

impl RecordType {
    /// Map a wire code to a known type. Unknown codes return `None` and are
    /// carried through as raw data with the original code preserved.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::RawData),
            0x02 => Some(Self::Json),
            0x03 => Some(Self::MsgPack),
            0x10 => Some(Self::KeyValue),
            0x11 => Some(Self::Timestamped),
            0xFF => Some(Self::Null),
            _ => None,
        }
    }
}

/// A single TLV record.
///
/// The type is kept as the raw wire byte so that records with codes this
/// client does not recognize survive a decode/re-encode unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    pub record_type: u8,
    pub value: Bytes,
}

impl TlvRecord {
    #[must_use]
    pub fn new(record_type: u8, value: Bytes) -> Self {
        Self { record_type, value }
    }

    /// Create a RawData record.
    #[must_use]
    pub fn raw(data: impl Into<Bytes>) -> Self {
        Self::new(RecordType::RawData as u8, data.into())
    }

    /// Create a JSON record from already-encoded JSON bytes.
    #[must_use]
    pub fn json(data: impl Into<Bytes>) -> Self {
        Self::new(RecordType::Json as u8, data.into())
    }

    /// Create a MessagePack record from already-encoded bytes.
    #[must_use]
    pub fn msgpack(data: impl Into<Bytes>) -> Self {
        Self::new(RecordType::MsgPack as u8, data.into())
    }

    /// Create a KeyValue record.
    #[must_use]
    pub fn key_value(key: &str, value: &[u8]) -> Self {
        let key_bytes = key.as_bytes();
        let mut buf = BytesMut::with_capacity(2 + key_bytes.len() + value.len());
        buf.put_u16_le(key_bytes.len() as u16);
        buf.put_slice(key_bytes);
        buf.put_slice(value);
        Self::new(RecordType::KeyValue as u8, buf.freeze())
    }

    /// Create a Timestamped record.
    #[must_use]
    pub fn timestamped(timestamp_ns: u64, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(8 + data.len());
        buf.put_u64_le(timestamp_ns);
        buf.put_slice(data);
        Self::new(RecordType::Timestamped as u8, buf.freeze())
    }

    /// Create a Null/tombstone record.
    #[must_use]
    pub fn null() -> Self {
        Self::new(RecordType::Null as u8, Bytes::new())
    }

    /// The known type, if this client recognizes the code.
    #[must_use]
    pub fn known_type(&self) -> Option<RecordType> {
        RecordType::from_code(self.record_type)
    }

    /// Total on-wire size of this record.
    #[must_use]
    pub fn total_size(&self) -> usize {
        TLV_HEADER_SIZE + self.value.len()
    }

    /// Encode this record to bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append this record's wire form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.record_type);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
    }

    /// Parse a KeyValue record into `(key, value)`.
    ///
    /// # Errors
    /// Fails if the value is shorter than its declared key.
    pub fn as_key_value(&self) -> Result<(String, Bytes)> {
        if self.value.len() < 2 {
            return Err(WireError::BufferTooSmall {
                required: 2,
                available: self.value.len(),
            });
        }
        let key_len = u16::from_le_bytes([self.value[0], self.value[1]]) as usize;
        if self.value.len() < 2 + key_len {
            return Err(WireError::MalformedPayload(format!(
                "KeyValue key overruns record: key_len {} in {} bytes",
                key_len,
                self.value.len()
            )));
        }
        let key = String::from_utf8_lossy(&self.value[2..2 + key_len]).into_owned();
        Ok((key, self.value.slice(2 + key_len..)))
    }

    /// Parse a Timestamped record into `(timestamp_ns, data)`.
    ///
    /// # Errors
    /// Fails if the value is shorter than the timestamp prefix.
    pub fn as_timestamped(&self) -> Result<(u64, Bytes)> {
        if self.value.len() < 8 {
            return Err(WireError::BufferTooSmall {
                required: 8,
                available: self.value.len(),
            });
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&self.value[..8]);
        Ok((u64::from_le_bytes(ts), self.value.slice(8..)))
    }
}

/// Encode a sequence of records into one contiguous payload.
#[must_use]
pub fn encode_records(records: &[TlvRecord]) -> Bytes {
    let total: usize = records.iter().map(TlvRecord::total_size).sum();
    let mut buf = BytesMut::with_capacity(total);
    for rec in records {
        rec.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Decode a contiguous payload into TLV records.
///
/// The payload is valid iff successive records exactly consume it: a record
/// whose length overruns the buffer, a truncated header, or a reserved type
/// byte all fail the whole decode.
///
/// # Errors
/// Returns `TlvOverrun`, `TlvTrailingBytes` or `ReservedTlvType` on a
/// malformed payload.
pub fn decode_records(payload: &Bytes) -> Result<Vec<TlvRecord>> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < payload.len() {
        let remaining = payload.len() - offset;
        if remaining < TLV_HEADER_SIZE {
            return Err(WireError::TlvTrailingBytes(remaining));
        }

        let record_type = payload[offset];
        if record_type == 0x00 {
            return Err(WireError::ReservedTlvType(record_type));
        }

        let length = u32::from_le_bytes([
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
            payload[offset + 4],
        ]) as usize;

        let end = offset + TLV_HEADER_SIZE + length;
        if end > payload.len() {
            return Err(WireError::TlvOverrun {
                offset,
                overrun: end - payload.len(),
            });
        }

        records.push(TlvRecord {
            record_type,
            value: payload.slice(offset + TLV_HEADER_SIZE..end),
        });
        offset = end;
    }

    Ok(records)
}
