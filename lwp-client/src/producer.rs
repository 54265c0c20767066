//! Batched producer with linger, compression, and a bounded ACK window.
//!
//! Records accumulate per topic until `batch_size` is reached, `linger_ms`
//! elapses, or the caller flushes. Each flushed batch becomes one PRODUCE
//! frame whose correlation id is the batch id; at most `max_pending_acks`
//! batches may be awaiting ACK at any time.
//!
//! ```rust,ignore
//! use lwp_client::{Producer, ProducerConfig};
//! use lwp_core::TlvRecord;
//!
//! let producer = Producer::connect(
//!     "10.0.10.11",
//!     1992,
//!     ProducerConfig::new().with_batch_size(16 * 1024).with_linger_ms(5),
//! ).await?;
//!
//! let ack = producer.send(1, TlvRecord::raw(&b"tick"[..])).await?;
//! println!("batch {} landed at offset {}", ack.batch_id, ack.offset);
//!
//! producer.flush().await?;
//! producer.close().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use lwp_core::TlvRecord;
use lwp_wire::compression::{maybe_compress, MaybeCompressed};
use lwp_wire::Frame;
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::config::ProducerConfig;
use crate::error::{ClientError, Result};
use crate::transport::{Transport, TransportConfig};

const MAX_SEND_RETRIES: u32 = 30;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Acknowledgment for a delivered batch.
#[derive(Debug, Clone)]
pub struct SendAck {
    /// Batch id: the correlation id the PRODUCE frame carried.
    pub batch_id: u64,
    pub topic_id: u32,
    /// Byte offset the batch landed at, as reported by the server.
    pub offset: u64,
}

struct PendingBatch {
    batch_id: u64,
    topic_id: u32,
    buf: BytesMut,
    record_count: u32,
    first_append: Instant,
    waiters: Vec<oneshot::Sender<Result<SendAck>>>,
}

impl PendingBatch {
    fn new(topic_id: u32, batch_id: u64) -> Self {
        Self {
            batch_id,
            topic_id,
            buf: BytesMut::with_capacity(16 * 1024),
            record_count: 0,
            first_append: Instant::now(),
            waiters: Vec::new(),
        }
    }

    fn push(&mut self, record: &TlvRecord, waiter: Option<oneshot::Sender<Result<SendAck>>>) {
        record.encode_into(&mut self.buf);
        self.record_count += 1;
        if let Some(waiter) = waiter {
            self.waiters.push(waiter);
        }
    }

    fn is_empty(&self) -> bool {
        self.record_count == 0
    }
}

/// Producer throughput counters.
#[derive(Debug, Default)]
pub struct ProducerMetrics {
    pub records_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub errors: AtomicU64,
}

impl ProducerMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_sent: self.records_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProducerMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub records_sent: u64,
    pub bytes_sent: u64,
    pub batches_sent: u64,
    pub errors: u64,
}

/// Batched producer over one transport.
pub struct Producer {
    transport: Arc<Transport>,
    config: ProducerConfig,
    batches: Arc<Mutex<HashMap<u32, PendingBatch>>>,
    /// One permit per in-flight batch slot; held from flush until ACK.
    window: Arc<Semaphore>,
    /// Serializes flushes so same-topic batches hit the wire in order.
    dispatch_lock: Arc<Mutex<()>>,
    metrics: Arc<ProducerMetrics>,
    running: Arc<AtomicBool>,
}

impl Producer {
    /// Connect to a broker and start the linger timer.
    pub async fn connect(host: &str, port: u16, config: ProducerConfig) -> Result<Self> {
        let transport_config = TransportConfig {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            auto_reconnect: config.auto_reconnect,
            tls: config.tls.clone(),
            ..Default::default()
        };
        let transport = Transport::connect(host.to_string(), port, transport_config).await?;
        Ok(Self::from_transport(transport, config))
    }

    /// Build a producer on an already-connected transport.
    #[must_use]
    pub fn from_transport(transport: Arc<Transport>, config: ProducerConfig) -> Self {
        let producer = Self {
            transport,
            window: Arc::new(Semaphore::new(config.max_pending_acks)),
            config,
            batches: Arc::new(Mutex::new(HashMap::new())),
            dispatch_lock: Arc::new(Mutex::new(())),
            metrics: Arc::new(ProducerMetrics::default()),
            running: Arc::new(AtomicBool::new(true)),
        };
        producer.spawn_linger_task();
        producer
    }

    /// Send a record and wait until the batch containing it is ACKed.
    ///
    /// Blocks while the in-flight window is full.
    pub async fn send(&self, topic_id: u32, record: TlvRecord) -> Result<SendAck> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();

        let ready = {
            let mut batches = self.batches.lock().await;
            let batch = batches
                .entry(topic_id)
                .or_insert_with(|| PendingBatch::new(topic_id, self.transport.next_correlation()));
            batch.push(&record, Some(tx));
            if batch.buf.len() >= self.config.batch_size {
                batches.remove(&topic_id)
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            let _guard = self.dispatch_lock.lock().await;
            let permit = self
                .window
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ClientError::Closed)?;
            dispatch_batch(
                &self.transport,
                &self.metrics,
                self.config.compression,
                batch,
                permit,
            )
            .await;
        }

        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Accept a record into the batch without awaiting the ACK.
    ///
    /// Returns the batch id as soon as the record is accepted. When the
    /// append would flush a batch and the in-flight window is full, the
    /// record is rejected with `Backpressure` instead of blocking.
    pub async fn send_async(&self, topic_id: u32, record: TlvRecord) -> Result<u64> {
        self.ensure_open()?;

        let (batch_id, ready, permit) = {
            let mut batches = self.batches.lock().await;
            let current = batches.get(&topic_id).map_or(0, |b| b.buf.len());
            let will_flush = current + record.total_size() >= self.config.batch_size;

            let permit = if will_flush {
                match self.window.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => return Err(ClientError::Backpressure),
                }
            } else {
                None
            };

            let batch = batches
                .entry(topic_id)
                .or_insert_with(|| PendingBatch::new(topic_id, self.transport.next_correlation()));
            batch.push(&record, None);
            let batch_id = batch.batch_id;
            let ready = if will_flush {
                batches.remove(&topic_id)
            } else {
                None
            };
            (batch_id, ready, permit)
        };

        if let (Some(batch), Some(permit)) = (ready, permit) {
            let _guard = self.dispatch_lock.lock().await;
            dispatch_batch(
                &self.transport,
                &self.metrics,
                self.config.compression,
                batch,
                permit,
            )
            .await;
        }

        Ok(batch_id)
    }

    /// Append several records atomically and wait for the batch ACK.
    ///
    /// The records land in one batch; it is flushed immediately when it
    /// exceeds `batch_size`, otherwise linger rules apply.
    pub async fn send_batch(&self, topic_id: u32, records: &[TlvRecord]) -> Result<SendAck> {
        self.ensure_open()?;
        if records.is_empty() {
            return Err(ClientError::InvalidFrame("empty batch".into()));
        }
        let (tx, rx) = oneshot::channel();

        let ready = {
            let mut batches = self.batches.lock().await;
            let batch = batches
                .entry(topic_id)
                .or_insert_with(|| PendingBatch::new(topic_id, self.transport.next_correlation()));
            for record in &records[..records.len() - 1] {
                batch.push(record, None);
            }
            // Sole waiter rides on the last record.
            batch.push(&records[records.len() - 1], Some(tx));
            if batch.buf.len() >= self.config.batch_size {
                batches.remove(&topic_id)
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            let _guard = self.dispatch_lock.lock().await;
            let permit = self
                .window
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ClientError::Closed)?;
            dispatch_batch(
                &self.transport,
                &self.metrics,
                self.config.compression,
                batch,
                permit,
            )
            .await;
        }

        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Force emission of every partial batch and wait for all outstanding
    /// ACKs.
    pub async fn flush(&self) -> Result<()> {
        let pending: Vec<PendingBatch> = {
            let mut batches = self.batches.lock().await;
            batches.drain().map(|(_, b)| b).collect()
        };

        for batch in pending {
            if batch.is_empty() {
                continue;
            }
            let _guard = self.dispatch_lock.lock().await;
            let permit = self
                .window
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ClientError::Closed)?;
            dispatch_batch(
                &self.transport,
                &self.metrics,
                self.config.compression,
                batch,
                permit,
            )
            .await;
        }

        // The window is empty exactly when every permit is reclaimable.
        let all = self
            .window
            .acquire_many(self.config.max_pending_acks as u32)
            .await
            .map_err(|_| ClientError::Closed)?;
        drop(all);
        Ok(())
    }

    /// Flush, then drain the transport to Closed.
    pub async fn close(self) -> Result<()> {
        let flush_result = self.flush().await;
        self.running.store(false, Ordering::Relaxed);
        self.transport.close().await?;
        flush_result
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of free slots in the in-flight window.
    #[must_use]
    pub fn available_window(&self) -> usize {
        self.window.available_permits()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    fn ensure_open(&self) -> Result<()> {
        if self.running.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }

    fn spawn_linger_task(&self) {
        let batches = self.batches.clone();
        let window = self.window.clone();
        let dispatch_lock = self.dispatch_lock.clone();
        let transport = self.transport.clone();
        let metrics = self.metrics.clone();
        let running = self.running.clone();
        let linger = Duration::from_millis(self.config.linger_ms.max(1));
        let compression = self.config.compression;

        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis((linger.as_millis() as u64 / 2).max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let expired: Vec<PendingBatch> = {
                    let mut map = batches.lock().await;
                    let now = Instant::now();
                    let due: Vec<u32> = map
                        .iter()
                        .filter(|(_, b)| {
                            !b.is_empty() && now.duration_since(b.first_append) >= linger
                        })
                        .map(|(topic, _)| *topic)
                        .collect();
                    due.into_iter().filter_map(|t| map.remove(&t)).collect()
                };

                for batch in expired {
                    let _guard = dispatch_lock.lock().await;
                    let Ok(permit) = window.clone().acquire_owned().await else {
                        return;
                    };
                    trace!(
                        batch_id = batch.batch_id,
                        topic_id = batch.topic_id,
                        "linger expired, flushing batch"
                    );
                    dispatch_batch(&transport, &metrics, compression, batch, permit).await;
                }
            }
        });
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("config", &self.config)
            .field("available_window", &self.available_window())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Put one batch on the wire and spawn its completion tracker. The permit is
/// held until the ACK (or terminal error) lands, bounding the in-flight
/// window.
async fn dispatch_batch(
    transport: &Arc<Transport>,
    metrics: &Arc<ProducerMetrics>,
    compression: bool,
    batch: PendingBatch,
    permit: OwnedSemaphorePermit,
) {
    let PendingBatch {
        batch_id,
        topic_id,
        buf,
        record_count,
        waiters,
        ..
    } = batch;
    let raw = buf.freeze();
    let byte_count = raw.len();

    let (payload, compressed) = if compression {
        match maybe_compress(&raw) {
            MaybeCompressed::Compressed(c) => (c, true),
            MaybeCompressed::Unchanged => (raw, false),
        }
    } else {
        (raw, false)
    };

    let frame = Frame::produce(batch_id, topic_id, payload, compressed);
    debug!(batch_id, topic_id, record_count, byte_count, compressed, "flushing batch");

    match transport.submit(frame.clone()).await {
        Ok(reply) => {
            let transport = transport.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                track_ack(
                    transport, metrics, frame, reply, batch_id, topic_id, record_count,
                    byte_count, waiters, permit,
                )
                .await;
            });
        }
        Err(err) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            warn!(batch_id, error = %err, "batch submit failed");
            for waiter in waiters {
                let _ = waiter.send(Err(err.duplicate()));
            }
            drop(permit);
        }
    }
}

/// Await the PRODUCE_ACK, resubmitting on retryable failures with capped
/// exponential backoff, then notify every waiter of the batch outcome.
#[allow(clippy::too_many_arguments)]
async fn track_ack(
    transport: Arc<Transport>,
    metrics: Arc<ProducerMetrics>,
    frame: Frame,
    first_reply: crate::transport::PendingReply,
    batch_id: u64,
    topic_id: u32,
    record_count: u32,
    byte_count: usize,
    waiters: Vec<oneshot::Sender<Result<SendAck>>>,
    permit: OwnedSemaphorePermit,
) {
    let mut reply = first_reply;
    let mut attempt = 0u32;
    let mut backoff = RETRY_BASE_DELAY;

    let result = 'ack: loop {
        match reply.await_reply().await {
            Ok(resp) => break Ok(resp),
            Err(err) if err.is_retryable() && attempt < MAX_SEND_RETRIES => {
                attempt += 1;
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                debug!(batch_id, attempt, error = %err, "retrying batch after transient error");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX_DELAY);

                loop {
                    match transport.submit(frame.clone()).await {
                        Ok(next) => {
                            reply = next;
                            continue 'ack;
                        }
                        Err(err) if err.is_retryable() && attempt < MAX_SEND_RETRIES => {
                            attempt += 1;
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(RETRY_MAX_DELAY);
                        }
                        Err(err) => break 'ack Err(err),
                    }
                }
            }
            Err(err) => break Err(err),
        }
    };

    match result {
        Ok(resp) => {
            metrics
                .records_sent
                .fetch_add(u64::from(record_count), Ordering::Relaxed);
            metrics
                .bytes_sent
                .fetch_add(byte_count as u64, Ordering::Relaxed);
            metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
            for waiter in waiters {
                let _ = waiter.send(Ok(SendAck {
                    batch_id,
                    topic_id,
                    offset: resp.offset,
                }));
            }
        }
        Err(err) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            warn!(batch_id, error = %err, "batch failed");
            for waiter in waiters {
                let _ = waiter.send(Err(err.duplicate()));
            }
        }
    }
    drop(permit);
}
