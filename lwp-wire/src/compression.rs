//! LZ4 payload compression for produce/fetch frames.
//!
//! A compressed payload is the LZ4 block stream with the uncompressed size
//! prepended (lz4_flex framing). The COMPRESSED header flag tells the peer
//! to decompress before TLV parsing; the whole TLV buffer is wrapped, never
//! individual records.

use bytes::Bytes;
use lwp_core::{WireError, MAX_PAYLOAD_LEN};

/// Result of a compression attempt.
#[derive(Debug)]
pub enum MaybeCompressed {
    /// Compressed form was smaller; send with COMPRESSED set.
    Compressed(Bytes),
    /// Compression did not pay for itself; send the original uncompressed.
    Unchanged,
}

/// Compress `payload`, keeping the result only if it is strictly smaller
/// than the input.
#[must_use]
pub fn maybe_compress(payload: &[u8]) -> MaybeCompressed {
    let compressed = lz4_flex::compress_prepend_size(payload);
    if compressed.len() < payload.len() {
        MaybeCompressed::Compressed(Bytes::from(compressed))
    } else {
        MaybeCompressed::Unchanged
    }
}

/// Decompress a COMPRESSED payload, bounding the decompressed size by
/// `max_len` (the negotiated payload cap).
///
/// # Errors
/// Fails on a malformed LZ4 stream or when the embedded uncompressed size
/// exceeds the cap.
pub fn decompress(payload: &[u8], max_len: u32) -> Result<Bytes, WireError> {
    if payload.len() < 4 {
        return Err(WireError::BufferTooSmall {
            required: 4,
            available: payload.len(),
        });
    }

    let declared = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if declared > max_len {
        return Err(WireError::PayloadTooLarge {
            len: declared,
            cap: max_len,
        });
    }

    lz4_flex::decompress_size_prepended(payload)
        .map(Bytes::from)
        .map_err(|e| WireError::MalformedPayload(format!("lz4 decompress: {}", e)))
}

/// Default decompression bound when no cap has been negotiated yet.
pub fn decompress_default(payload: &[u8]) -> Result<Bytes, WireError> {
    decompress(payload, MAX_PAYLOAD_LEN)
}
