//! Standalone pull consumer: offset-managed fetch loop with seek semantics,
//! pluggable offset persistence and auto-commit.
//!
//! ```rust,ignore
//! use lwp_client::{ConsumerConfig, StandaloneConsumer};
//!
//! let mut consumer = StandaloneConsumer::connect(
//!     "10.0.10.11",
//!     1992,
//!     ConsumerConfig::new("my-app", 1).with_offset_dir(Path::new("/var/lib/lwp/offsets")),
//! ).await?;
//!
//! loop {
//!     if let Some(result) = consumer.poll().await? {
//!         for record in &result.records {
//!             process(record);
//!         }
//!         consumer.commit()?;
//!     }
//! }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use lwp_core::{decode_records, TlvRecord};
use lwp_wire::compression;
use lwp_wire::{FetchResponse, Frame};
use tracing::{debug, trace, warn};

use crate::config::ConsumerConfig;
use crate::error::{ClientError, Result};
use crate::offset::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
use crate::transport::{Transport, TransportConfig};

/// Position specifier for seeking within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Offset 0.
    Beginning,
    /// The topic tail, resolved by a SEEK_END request.
    End,
    /// A specific byte offset.
    Offset(u64),
}

/// Records returned by one poll.
#[derive(Debug, Clone)]
pub struct PollResult {
    /// Decoded TLV records.
    pub records: Vec<TlvRecord>,
    /// The raw (decompressed) TLV buffer the records were decoded from.
    pub data: Bytes,
    pub start_offset: u64,
    /// Cursor position after consuming this window.
    pub end_offset: u64,
    /// Topic tail as reported by the server.
    pub tail_offset: u64,
}

impl PollResult {
    /// Bytes between this window's end and the topic tail.
    #[must_use]
    pub fn lag(&self) -> u64 {
        self.tail_offset.saturating_sub(self.end_offset)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Standalone consumer with a client-managed cursor.
///
/// Each consumer owns one `(topic_id, next_offset)` cursor. The cursor only
/// moves forward as fetches complete; `seek` is the sole way to move it
/// backwards.
pub struct StandaloneConsumer {
    transport: Arc<Transport>,
    config: ConsumerConfig,
    offset_store: Arc<dyn OffsetStore>,
    consumer_id: u64,
    next_offset: u64,
    committed_offset: u64,
    last_commit: Instant,
    /// Latest tail seen in a fetch response; drives `lag_hint`.
    tail_hint: u64,
    closed: bool,
}

impl StandaloneConsumer {
    /// Connect, load any persisted offset, and resolve the start position.
    pub async fn connect(host: &str, port: u16, config: ConsumerConfig) -> Result<Self> {
        let transport_config = TransportConfig {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            auto_reconnect: config.auto_reconnect,
            tls: config.tls.clone(),
            ..Default::default()
        };
        let transport = Transport::connect(host.to_string(), port, transport_config).await?;
        Self::from_transport(transport, config).await
    }

    /// Build a consumer on an already-connected transport.
    pub async fn from_transport(
        transport: Arc<Transport>,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let offset_store: Arc<dyn OffsetStore> = match &config.offset_dir {
            Some(dir) => Arc::new(FileOffsetStore::open(dir)?),
            None => Arc::new(MemoryOffsetStore::new()),
        };
        Self::with_offset_store(transport, config, offset_store).await
    }

    /// Build a consumer with a custom offset store.
    pub async fn with_offset_store(
        transport: Arc<Transport>,
        config: ConsumerConfig,
        offset_store: Arc<dyn OffsetStore>,
    ) -> Result<Self> {
        let stored = offset_store
            .load(&config.consumer_name, config.topic_id)?;

        let consumer_id = hash_consumer_name(&config.consumer_name);
        let mut consumer = Self {
            transport,
            offset_store,
            consumer_id,
            next_offset: 0,
            committed_offset: stored.unwrap_or(0),
            last_commit: Instant::now(),
            tail_hint: 0,
            closed: false,
            config,
        };

        match stored {
            Some(offset) => {
                debug!(
                    consumer = %consumer.config.consumer_name,
                    topic_id = consumer.config.topic_id,
                    offset,
                    "resuming from stored offset"
                );
                consumer.next_offset = offset;
            }
            None => {
                let start = consumer.config.start_position;
                consumer.apply_start_position(start).await?;
            }
        }

        Ok(consumer)
    }

    async fn apply_start_position(&mut self, position: SeekPosition) -> Result<()> {
        match position {
            SeekPosition::Beginning => self.next_offset = 0,
            SeekPosition::Offset(offset) => self.next_offset = offset,
            SeekPosition::End => {
                self.seek_to(SeekPosition::End).await?;
            }
        }
        Ok(())
    }

    /// Cursor position of the next fetch.
    #[must_use]
    pub fn current_offset(&self) -> u64 {
        self.next_offset
    }

    /// Last offset persisted to the offset store.
    #[must_use]
    pub fn committed_offset(&self) -> u64 {
        self.committed_offset
    }

    /// Consumer lag based on the last fetch response.
    #[must_use]
    pub fn lag_hint(&self) -> u64 {
        self.tail_hint.saturating_sub(self.next_offset)
    }

    #[must_use]
    pub fn topic_id(&self) -> u32 {
        self.config.topic_id
    }

    #[must_use]
    pub fn consumer_name(&self) -> &str {
        &self.config.consumer_name
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Fetch the next window of records.
    ///
    /// Returns `None` when no data arrives within `poll_timeout`. Advances
    /// the cursor to the server-reported end offset; the cursor never moves
    /// backwards here, only via [`StandaloneConsumer::seek`].
    pub async fn poll(&mut self) -> Result<Option<PollResult>> {
        self.ensure_open()?;
        self.maybe_auto_commit()?;

        let frame = Frame::fetch(
            self.transport.next_correlation(),
            self.config.topic_id,
            self.next_offset,
            self.config.max_fetch_bytes,
        );

        let reply = match tokio::time::timeout(
            self.config.poll_timeout,
            self.transport.request(frame),
        )
        .await
        {
            Err(_) | Ok(Err(ClientError::Timeout)) => return Ok(None),
            Ok(Err(err)) => return Err(err),
            Ok(Ok(reply)) => reply,
        };

        let body = FetchResponse::parse(&reply.payload)?;
        self.tail_hint = body.tail_offset;

        if body.data.is_empty() {
            trace!(
                topic_id = self.config.topic_id,
                offset = self.next_offset,
                "fetch returned no data"
            );
            return Ok(None);
        }

        let data = if reply.is_compressed() {
            compression::decompress(&body.data, self.transport.payload_cap())?
        } else {
            body.data.clone()
        };
        let records = decode_records(&data)?;

        if body.end_offset > self.next_offset {
            self.next_offset = body.end_offset;
        }

        trace!(
            topic_id = self.config.topic_id,
            records = records.len(),
            end_offset = body.end_offset,
            lag = body.lag(),
            "poll delivered records"
        );

        Ok(Some(PollResult {
            records,
            data,
            start_offset: body.start_offset,
            end_offset: body.end_offset,
            tail_offset: body.tail_offset,
        }))
    }

    /// Move the cursor to a specific byte offset. Any unconsumed server-side
    /// window is abandoned; the next fetch starts here.
    pub fn seek(&mut self, offset: u64) {
        debug!(
            consumer = %self.config.consumer_name,
            topic_id = self.config.topic_id,
            offset,
            "seek"
        );
        self.next_offset = offset;
    }

    /// Seek to a named position; returns the resolved offset.
    ///
    /// `End` asks the server for the tail offset via SEEK_END.
    pub async fn seek_to(&mut self, position: SeekPosition) -> Result<u64> {
        match position {
            SeekPosition::Beginning => {
                self.seek(0);
                Ok(0)
            }
            SeekPosition::Offset(offset) => {
                self.seek(offset);
                Ok(offset)
            }
            SeekPosition::End => {
                let frame = Frame::seek_end(
                    self.transport.next_correlation(),
                    self.config.topic_id,
                );
                let reply = self.transport.request(frame).await?;
                let tail = reply.offset;
                self.tail_hint = tail;
                self.seek(tail);
                Ok(tail)
            }
        }
    }

    /// Rewind to the beginning of the topic.
    pub fn rewind(&mut self) {
        self.seek(0);
    }

    /// Persist the current cursor to the offset store (local commit).
    pub fn commit(&mut self) -> Result<()> {
        self.offset_store.store(
            &self.config.consumer_name,
            self.config.topic_id,
            self.next_offset,
        )?;
        self.committed_offset = self.next_offset;
        self.last_commit = Instant::now();
        trace!(
            consumer = %self.config.consumer_name,
            topic_id = self.config.topic_id,
            offset = self.next_offset,
            "offset committed"
        );
        Ok(())
    }

    /// Persist locally and also record the offset on the server.
    ///
    /// Returns the offset acknowledged by the server.
    pub async fn commit_to_server(&mut self) -> Result<u64> {
        self.commit()?;

        let frame = Frame::commit(
            self.transport.next_correlation(),
            self.config.topic_id,
            self.consumer_id,
            self.committed_offset,
        );
        let reply = self.transport.request(frame).await?;
        Ok(reply.offset)
    }

    /// Commit any outstanding progress, then drain the transport.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.next_offset > self.committed_offset {
            if let Err(err) = self.commit() {
                warn!(error = %err, "final commit failed on close");
            }
        }
        self.transport.close().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_auto_commit(&mut self) -> Result<()> {
        let Some(interval) = self.config.auto_commit_interval else {
            return Ok(());
        };
        if self.last_commit.elapsed() < interval {
            return Ok(());
        }
        if self.next_offset > self.committed_offset {
            self.commit()
        } else {
            self.last_commit = Instant::now();
            Ok(())
        }
    }
}

impl std::fmt::Debug for StandaloneConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaloneConsumer")
            .field("consumer_name", &self.config.consumer_name)
            .field("topic_id", &self.config.topic_id)
            .field("next_offset", &self.next_offset)
            .field("committed_offset", &self.committed_offset)
            .finish()
    }
}

fn hash_consumer_name(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}
