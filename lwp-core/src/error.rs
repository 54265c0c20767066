use thiserror::Error;

/// Errors raised by the pure codec layer.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("invalid magic bytes - expected LANC")]
    InvalidMagic,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("header CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("payload length {len} exceeds cap of {cap} bytes")]
    PayloadTooLarge { len: u32, cap: u32 },

    #[error("buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    #[error("TLV record at offset {offset} overruns buffer by {overrun} bytes")]
    TlvOverrun { offset: usize, overrun: usize },

    #[error("trailing bytes after last TLV record: {0}")]
    TlvTrailingBytes(usize),

    #[error("reserved TLV type {0:#04x}")]
    ReservedTlvType(u8),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, WireError>;
