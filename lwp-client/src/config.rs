//! Configuration for the client façades.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lwp_core::DEFAULT_PORT;
use lwp_wire::TlsClientConfig;
use rand::Rng;

use crate::consumer::SeekPosition;

/// Configuration for the management client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Optional TLS configuration for encrypted connections.
    pub tls: Option<TlsClientConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable TLS with the provided configuration.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for the batched producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Batch buffer size in bytes that triggers an immediate flush.
    pub batch_size: usize,
    /// Maximum time a partial batch may wait before being flushed.
    pub linger_ms: u64,
    /// LZ4-compress batches when the compressed form is smaller.
    pub compression: bool,
    /// Maximum number of flushed batches awaiting ACK.
    pub max_pending_acks: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Reconnect automatically on transport failure.
    pub auto_reconnect: bool,
    pub tls: Option<TlsClientConfig>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32 * 1024,
            linger_ms: 5,
            compression: false,
            max_pending_acks: 64,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            tls: None,
        }
    }
}

impl ProducerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn with_linger_ms(mut self, ms: u64) -> Self {
        self.linger_ms = ms;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn with_max_pending_acks(mut self, n: usize) -> Self {
        self.max_pending_acks = n.max(1);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Configuration for the standalone pull consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name used to key persisted offsets.
    pub consumer_name: String,
    pub topic_id: u32,
    /// Fetch budget per poll.
    pub max_fetch_bytes: u32,
    /// Where to start when no stored offset exists.
    pub start_position: SeekPosition,
    /// Directory for offset persistence (None = in-memory only).
    pub offset_dir: Option<PathBuf>,
    /// Auto-commit cadence (None = manual commit only).
    pub auto_commit_interval: Option<Duration>,
    /// How long `poll()` waits for data before returning `None`.
    pub poll_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub auto_reconnect: bool,
    pub tls: Option<TlsClientConfig>,
}

impl ConsumerConfig {
    pub fn new(consumer_name: impl Into<String>, topic_id: u32) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            topic_id,
            max_fetch_bytes: 64 * 1024,
            start_position: SeekPosition::Beginning,
            offset_dir: None,
            auto_commit_interval: Some(Duration::from_secs(5)),
            poll_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            tls: None,
        }
    }

    #[must_use]
    pub fn with_max_fetch_bytes(mut self, bytes: u32) -> Self {
        self.max_fetch_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_start_position(mut self, position: SeekPosition) -> Self {
        self.start_position = position;
        self
    }

    /// Persist offsets under `dir`; one file per (consumer, topic).
    #[must_use]
    pub fn with_offset_dir(mut self, dir: &Path) -> Self {
        self.offset_dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn with_auto_commit_interval(mut self, interval: Option<Duration>) -> Self {
        self.auto_commit_interval = interval;
        self
    }

    /// Disable auto-commit.
    #[must_use]
    pub fn with_manual_commit(mut self) -> Self {
        self.auto_commit_interval = None;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Reconnection parameters with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0 = unlimited attempts.
    pub max_attempts: u32,
    /// Jitter fraction applied as `delay * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `n` (0-based): `min(max, base * 2^n)`
    /// with symmetric jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(1u64 << attempt.min(32))
            .min(max_ms);

        let jitter = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = (delay_ms as f64 * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}
