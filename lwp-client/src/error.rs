//! Closed error set for client operations, with per-kind retryability.

use std::net::SocketAddr;

use lwp_core::WireError;
use lwp_wire::{ErrorPayload, Frame, ServerErrorCode};
use thiserror::Error;

/// Errors surfaced by client operations.
///
/// Retryability is a pure function of the variant (plus the carried hint
/// payload for `NotLeader` / `ServerCatchingUp`); see [`ClientError::is_retryable`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// TCP-level failure: refused, reset, EOF, DNS.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Request deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Server paused production or the local in-flight window is full.
    #[error("backpressure: server paused or in-flight window full")]
    Backpressure,

    /// This node is not the leader; reconnect to `leader_addr` if present.
    #[error("not leader{}", fmt_leader(.leader_addr))]
    NotLeader { leader_addr: Option<SocketAddr> },

    /// Server replica is still catching up to `server_offset`.
    #[error("server catching up at offset {server_offset}")]
    ServerCatchingUp { server_offset: u64 },

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Protocol corruption. Forces a disconnect when seen on a live
    /// connection.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Use after close.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// True if the operation may be retried after transport recovery.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout | Self::Backpressure => true,
            // Retry against the redirect target / after the server catches up.
            Self::NotLeader { .. } | Self::ServerCatchingUp { .. } => true,
            Self::TopicNotFound(_)
            | Self::AccessDenied(_)
            | Self::InvalidFrame(_)
            | Self::Closed => false,
        }
    }

    /// Structural copy of this error for fanning one failure out to several
    /// batch waiters. `Connection` keeps its kind but re-wraps the message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Connection(e) => Self::Connection(std::io::Error::new(e.kind(), e.to_string())),
            Self::Timeout => Self::Timeout,
            Self::Backpressure => Self::Backpressure,
            Self::NotLeader { leader_addr } => Self::NotLeader {
                leader_addr: *leader_addr,
            },
            Self::ServerCatchingUp { server_offset } => Self::ServerCatchingUp {
                server_offset: *server_offset,
            },
            Self::TopicNotFound(msg) => Self::TopicNotFound(msg.clone()),
            Self::AccessDenied(msg) => Self::AccessDenied(msg.clone()),
            Self::InvalidFrame(msg) => Self::InvalidFrame(msg.clone()),
            Self::Closed => Self::Closed,
        }
    }

    /// Map a server ERROR frame to a typed error via the 1:1 code table.
    #[must_use]
    pub fn from_error_frame(frame: &Frame) -> Self {
        let payload = match ErrorPayload::parse(&frame.payload) {
            Ok(p) => p,
            Err(e) => return Self::InvalidFrame(format!("malformed error payload: {}", e)),
        };

        match ServerErrorCode::from_code(payload.code) {
            Some(ServerErrorCode::TopicNotFound) => Self::TopicNotFound(payload.detail_text()),
            Some(ServerErrorCode::NotLeader) => Self::NotLeader {
                leader_addr: payload.detail_text().parse().ok(),
            },
            Some(ServerErrorCode::ServerCatchingUp) => Self::ServerCatchingUp {
                server_offset: payload.detail_u64().unwrap_or(0),
            },
            Some(ServerErrorCode::AccessDenied) => Self::AccessDenied(payload.detail_text()),
            Some(ServerErrorCode::InvalidArgument) => {
                Self::InvalidFrame(format!("server rejected request: {}", payload.detail_text()))
            }
            Some(ServerErrorCode::Internal) => Self::Connection(std::io::Error::other(format!(
                "server internal error: {}",
                payload.detail_text()
            ))),
            None => Self::InvalidFrame(format!(
                "unknown server error code {:#06x}: {}",
                payload.code,
                payload.detail_text()
            )),
        }
    }
}

fn fmt_leader(addr: &Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => format!(", redirect to {}", addr),
        None => ", leader unknown".to_string(),
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        Self::InvalidFrame(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
