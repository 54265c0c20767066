#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

pub mod compression;
mod frame;
mod header;
pub mod tls;

pub use frame::{encode_frame, parse_frame, FetchResponse, Frame};
pub use header::{
    ErrorPayload, FrameFlags, HelloAckPayload, HelloPayload, LwpHeader, Opcode, ServerErrorCode,
};
pub use lwp_core::{LWP_HEADER_SIZE, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
pub use tls::{TlsClientConfig, TlsError, TlsResult};
