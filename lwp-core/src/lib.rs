#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod checksum;
mod error;
pub mod tlv;

pub use checksum::crc32c;
pub use error::{Result, WireError};
pub use tlv::{decode_records, encode_records, RecordType, TlvRecord};

/// Magic bytes at the start of every LWP frame.
pub const LWP_MAGIC: [u8; 4] = *b"LANC";

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed LWP header size in bytes.
pub const LWP_HEADER_SIZE: usize = 44;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 1992;

/// Default payload cap before HELLO_ACK negotiates one (16 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// TLV record header size: type(1) + length(4).
pub const TLV_HEADER_SIZE: usize = 5;

/// Inbound idle time after which the transport probes with PING.
pub const KEEPALIVE_IDLE_SECS: u64 = 30;

/// Time allowed for a PONG (or any inbound frame) after a PING probe.
pub const KEEPALIVE_PROBE_SECS: u64 = 5;
