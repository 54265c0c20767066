#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod client;
pub mod config;
mod consumer;
mod error;
mod multiplexer;
pub mod offset;
pub mod producer;
pub mod transport;

pub use client::{LwpClient, TopicInfo};
pub use config::{ClientConfig, ConsumerConfig, ProducerConfig, ReconnectConfig};
pub use consumer::{PollResult, SeekPosition, StandaloneConsumer};
pub use error::{ClientError, Result};
pub use offset::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use producer::{MetricsSnapshot, Producer, ProducerMetrics, SendAck};
pub use transport::{ConnState, Transport, TransportConfig};

pub use lwp_core::{RecordType, TlvRecord};
pub use lwp_wire::TlsClientConfig;
