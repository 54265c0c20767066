//! End-to-end tests against an in-process mock broker speaking LWP over a
//! real TCP socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use lwp_client::{
    ClientConfig, ClientError, ConnState, ConsumerConfig, LwpClient, Producer, ProducerConfig,
    ReconnectConfig, SeekPosition, StandaloneConsumer, TlvRecord, Transport, TransportConfig,
};
use lwp_core::MAX_PAYLOAD_LEN;
use lwp_wire::compression;
use lwp_wire::{encode_frame, parse_frame, FetchResponse, Frame, FrameFlags, Opcode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

// ============================================================================
// Mock broker
// ============================================================================

#[derive(Default)]
struct TopicLog {
    base: u64,
    data: Vec<u8>,
}

impl TopicLog {
    fn tail(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<u32, TopicLog>,
    topics: HashMap<u32, serde_json::Value>,
    next_topic_id: u32,
    /// (received-at, correlation id, topic, was-compressed) per PRODUCE frame.
    produces: Vec<(Instant, u64, u32, bool)>,
}

#[derive(Clone)]
struct MockBroker {
    port: u16,
    state: Arc<Mutex<BrokerState>>,
    /// When present, each PRODUCE consumes one permit before it is ACKed.
    ack_gate: Option<Arc<Semaphore>>,
}

impl MockBroker {
    async fn spawn() -> Self {
        Self::spawn_inner(None).await
    }

    async fn spawn_with_gated_acks() -> Self {
        Self::spawn_inner(Some(Arc::new(Semaphore::new(0)))).await
    }

    async fn spawn_inner(ack_gate: Option<Arc<Semaphore>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(BrokerState {
            next_topic_id: 1,
            ..Default::default()
        }));

        let broker = Self {
            port,
            state: state.clone(),
            ack_gate,
        };

        let accept_broker = broker.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let conn_broker = accept_broker.clone();
                tokio::spawn(async move { conn_broker.serve(socket).await });
            }
        });

        broker
    }

    fn seed_topic(&self, topic_id: u32, base: u64) {
        let mut state = self.state.lock().unwrap();
        state.logs.insert(topic_id, TopicLog { base, data: Vec::new() });
    }

    fn produce_count(&self) -> usize {
        self.state.lock().unwrap().produces.len()
    }

    fn produces(&self) -> Vec<(Instant, u64, u32, bool)> {
        self.state.lock().unwrap().produces.clone()
    }

    fn release_acks(&self, n: usize) {
        if let Some(gate) = &self.ack_gate {
            gate.add_permits(n);
        }
    }

    async fn serve(&self, mut socket: tokio::net::TcpStream) {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            while let Ok(Some((frame, consumed))) = parse_frame(&buf, MAX_PAYLOAD_LEN) {
                buf.advance(consumed);
                let Some(reply) = self.handle(frame).await else { continue };
                if socket.write_all(&encode_frame(&reply)).await.is_err() {
                    return;
                }
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    async fn handle(&self, frame: Frame) -> Option<Frame> {
        match frame.opcode {
            Opcode::Hello => Some(Frame::hello_ack(frame.correlation_id, MAX_PAYLOAD_LEN)),
            Opcode::Ping => Some(Frame::pong(frame.correlation_id)),
            Opcode::Produce => {
                let compressed = frame.flags.contains(FrameFlags::COMPRESSED);
                let payload = if compressed {
                    compression::decompress(&frame.payload, MAX_PAYLOAD_LEN).unwrap()
                } else {
                    frame.payload.clone()
                };
                // The broker validates the batch is a well-formed TLV run.
                lwp_core::decode_records(&payload).unwrap();

                if let Some(gate) = &self.ack_gate {
                    gate.acquire().await.unwrap().forget();
                }

                let offset = {
                    let mut state = self.state.lock().unwrap();
                    state
                        .produces
                        .push((Instant::now(), frame.correlation_id, frame.topic_id, compressed));
                    let log = state.logs.entry(frame.topic_id).or_default();
                    log.data.extend_from_slice(&payload);
                    log.tail()
                };
                Some(Frame::produce_ack(frame.correlation_id, frame.topic_id, offset))
            }
            Opcode::Fetch => {
                let max_bytes = u32::from_le_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]) as usize;
                let state = self.state.lock().unwrap();
                let log = state.logs.get(&frame.topic_id);
                let (base, tail, data) = match log {
                    Some(log) => (log.base, log.tail(), log.data.clone()),
                    None => (0, 0, Vec::new()),
                };
                let start = frame.offset.max(base).min(tail);
                let from = (start - base) as usize;
                let take = (data.len() - from).min(max_bytes);
                let window = Bytes::copy_from_slice(&data[from..from + take]);
                let end = start + window.len() as u64;
                let body = FetchResponse {
                    start_offset: start,
                    end_offset: end,
                    tail_offset: tail,
                    data: window,
                };
                Some(Frame::fetch_resp(frame.correlation_id, frame.topic_id, &body))
            }
            Opcode::SeekEnd => {
                let state = self.state.lock().unwrap();
                let tail = state.logs.get(&frame.topic_id).map_or(0, TopicLog::tail);
                Some(
                    Frame::new(Opcode::SeekEnd, frame.correlation_id)
                        .with_flags(FrameFlags::RESPONSE)
                        .with_topic(frame.topic_id)
                        .with_offset(tail),
                )
            }
            Opcode::Commit => Some(
                Frame::new(Opcode::Commit, frame.correlation_id)
                    .with_flags(FrameFlags::RESPONSE)
                    .with_topic(frame.topic_id)
                    .with_offset(frame.offset),
            ),
            Opcode::CreateTopic => {
                let name = String::from_utf8_lossy(&frame.payload).into_owned();
                let mut state = self.state.lock().unwrap();
                let id = state.next_topic_id;
                state.next_topic_id += 1;
                let meta = serde_json::json!({
                    "id": id,
                    "name": name,
                    "created_at_ns": 1_700_000_000_000_000_000u64,
                });
                state.topics.insert(id, meta.clone());
                state.logs.entry(id).or_default();
                Some(
                    Frame::new(Opcode::CreateTopic, frame.correlation_id)
                        .with_flags(FrameFlags::RESPONSE)
                        .with_payload(Bytes::from(meta.to_string())),
                )
            }
            Opcode::GetTopic => {
                let state = self.state.lock().unwrap();
                let meta = state.topics.get(&frame.topic_id).cloned();
                drop(state);
                match meta {
                    Some(meta) => Some(
                        Frame::new(Opcode::GetTopic, frame.correlation_id)
                            .with_flags(FrameFlags::RESPONSE)
                            .with_payload(Bytes::from(meta.to_string())),
                    ),
                    None => Some(Frame::error(
                        frame.correlation_id,
                        &lwp_wire::ErrorPayload::new(
                            lwp_wire::ServerErrorCode::TopicNotFound,
                            Bytes::from(format!("no such topic: {}", frame.topic_id)),
                        ),
                    )),
                }
            }
            Opcode::ListTopics => {
                let state = self.state.lock().unwrap();
                let topics: Vec<_> = state.topics.values().cloned().collect();
                let body = serde_json::json!({ "topics": topics });
                Some(
                    Frame::new(Opcode::ListTopics, frame.correlation_id)
                        .with_flags(FrameFlags::RESPONSE)
                        .with_payload(Bytes::from(body.to_string())),
                )
            }
            Opcode::SetRetention => {
                let max_age = u64::from_le_bytes(frame.payload[0..8].try_into().unwrap());
                let max_bytes = u64::from_le_bytes(frame.payload[8..16].try_into().unwrap());
                let mut state = self.state.lock().unwrap();
                if let Some(meta) = state.topics.get_mut(&frame.topic_id) {
                    meta["max_age_secs"] = serde_json::json!(max_age);
                    meta["max_bytes"] = serde_json::json!(max_bytes);
                }
                Some(
                    Frame::new(Opcode::SetRetention, frame.correlation_id)
                        .with_flags(FrameFlags::RESPONSE)
                        .with_topic(frame.topic_id),
                )
            }
            Opcode::DeleteTopic => {
                let mut state = self.state.lock().unwrap();
                state.topics.remove(&frame.topic_id);
                state.logs.remove(&frame.topic_id);
                Some(
                    Frame::new(Opcode::DeleteTopic, frame.correlation_id)
                        .with_flags(FrameFlags::RESPONSE)
                        .with_topic(frame.topic_id),
                )
            }
            _ => None,
        }
    }
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig::new("127.0.0.1", port).with_connect_timeout(Duration::from_secs(2))
}

// ============================================================================
// Management client
// ============================================================================

#[tokio::test]
async fn management_topic_lifecycle() {
    let broker = MockBroker::spawn().await;
    let client = LwpClient::connect(client_config(broker.port)).await.unwrap();

    let topic = client.create_topic("orders").await.unwrap();
    assert_eq!(topic.name, "orders");
    assert!(topic.max_age_secs.is_none());

    client
        .set_retention(topic.id as u32, 86_400, 1 << 30)
        .await
        .unwrap();
    let fetched = client.get_topic(topic.id as u32).await.unwrap();
    assert_eq!(fetched.max_age_secs, Some(86_400));
    assert_eq!(fetched.max_bytes, Some(1 << 30));

    let second = client.create_topic("metrics").await.unwrap();
    let listed = client.list_topics().await.unwrap();
    assert_eq!(listed.len(), 2);

    client.delete_topic(second.id as u32).await.unwrap();
    assert_eq!(client.list_topics().await.unwrap().len(), 1);

    // Errors map through the typed taxonomy.
    let missing = client.get_topic(999).await.unwrap_err();
    assert!(matches!(missing, ClientError::TopicNotFound(_)));
    assert!(!missing.is_retryable());

    let latency = client.ping().await.unwrap();
    assert!(latency < Duration::from_secs(1));

    client.close().await.unwrap();
}

// ============================================================================
// Producer
// ============================================================================

#[tokio::test]
async fn send_acks_exactly_one_produce_frame() {
    let broker = MockBroker::spawn().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new().with_batch_size(1).with_linger_ms(1),
    )
    .await
    .unwrap();

    let ack = producer
        .send(7, TlvRecord::raw(Bytes::from_static(b"hello lwp")))
        .await
        .unwrap();
    assert_eq!(ack.topic_id, 7);
    assert!(ack.offset > 0);

    // Exactly one PRODUCE frame, tagged with the acked batch id.
    let produces = broker.produces();
    assert_eq!(produces.len(), 1);
    assert_eq!(produces[0].1, ack.batch_id);
    assert_eq!(produces[0].2, 7);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn linger_flushes_partial_batch() {
    let broker = MockBroker::spawn().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new()
            .with_batch_size(1_000_000)
            .with_linger_ms(100),
    )
    .await
    .unwrap();

    let started = Instant::now();
    producer
        .send_async(1, TlvRecord::raw(Bytes::from_static(b"a")))
        .await
        .unwrap();

    // Well inside the linger window nothing has been written.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(broker.produce_count(), 0, "batch flushed before linger expired");

    // After the linger window exactly one frame lands.
    let mut flushed_at = None;
    for _ in 0..100 {
        if broker.produce_count() == 1 {
            flushed_at = Some(started.elapsed());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let flushed_at = flushed_at.expect("linger never flushed the batch");
    assert!(flushed_at >= Duration::from_millis(90), "flushed at {:?}", flushed_at);
    assert_eq!(broker.produce_count(), 1);

    producer.close().await.unwrap();
    assert_eq!(broker.produce_count(), 1, "close re-sent the batch");
}

#[tokio::test]
async fn window_rejects_third_unacked_batch() {
    let broker = MockBroker::spawn_with_gated_acks().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new()
            .with_batch_size(1)
            .with_linger_ms(1000)
            .with_max_pending_acks(2),
    )
    .await
    .unwrap();

    let rec = || TlvRecord::raw(Bytes::from_static(b"r"));

    producer.send_async(1, rec()).await.unwrap();
    producer.send_async(1, rec()).await.unwrap();
    assert_eq!(producer.available_window(), 0);

    // Third flush attempt exceeds the window.
    let err = producer.send_async(1, rec()).await.unwrap_err();
    assert!(matches!(err, ClientError::Backpressure));
    assert!(err.is_retryable());

    // One ACK frees a slot; a subsequent send_async is accepted.
    broker.release_acks(1);
    let mut accepted = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if producer.send_async(1, rec()).await.is_ok() {
            accepted = true;
            break;
        }
    }
    assert!(accepted, "send_async still rejected after an ACK freed the window");

    broker.release_acks(16);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn send_batch_keeps_records_in_one_frame() {
    let broker = MockBroker::spawn().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new()
            .with_batch_size(1_000_000)
            .with_linger_ms(2),
    )
    .await
    .unwrap();

    let records = vec![
        TlvRecord::key_value("sym", b"ETH"),
        TlvRecord::timestamped(1_700_000_000_000_000_000, b"6942.25"),
        TlvRecord::null(),
    ];
    let ack = producer.send_batch(3, &records).await.unwrap();
    assert_eq!(broker.produce_count(), 1);

    let metrics = producer.metrics();
    assert_eq!(metrics.batches_sent, 1);
    assert_eq!(metrics.records_sent, 3);
    assert_eq!(broker.produces()[0].1, ack.batch_id);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn compressed_batch_roundtrips_through_fetch() {
    let broker = MockBroker::spawn().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new()
            .with_batch_size(1)
            .with_linger_ms(1)
            .with_compression(true),
    )
    .await
    .unwrap();

    // Repetitive payload so LZ4 actually wins.
    let value: Vec<u8> = std::iter::repeat(b"lance ".as_slice())
        .take(200)
        .flatten()
        .copied()
        .collect();
    producer
        .send(4, TlvRecord::raw(Bytes::from(value.clone())))
        .await
        .unwrap();

    assert!(broker.produces()[0].3, "payload was not sent compressed");

    let mut consumer = StandaloneConsumer::connect(
        "127.0.0.1",
        broker.port,
        ConsumerConfig::new("reader", 4).with_poll_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    let result = consumer.poll().await.unwrap().expect("no records fetched");
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].value.as_ref(), value.as_slice());

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
}

// ============================================================================
// Consumer
// ============================================================================

#[tokio::test]
async fn seek_end_then_poll_tracks_tail_and_lag() {
    let broker = MockBroker::spawn().await;
    // Topic whose log starts at byte 1024 with no live data.
    broker.seed_topic(9, 1024);

    let mut consumer = StandaloneConsumer::connect(
        "127.0.0.1",
        broker.port,
        ConsumerConfig::new("tail-reader", 9).with_poll_timeout(Duration::from_millis(500)),
    )
    .await
    .unwrap();

    let tail = consumer.seek_to(SeekPosition::End).await.unwrap();
    assert_eq!(tail, 1024);
    assert_eq!(consumer.current_offset(), 1024);

    // Empty topic: nothing within the poll timeout.
    assert!(consumer.poll().await.unwrap().is_none());

    // One record of 50 wire bytes lands (5-byte TLV header + 45 bytes).
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new().with_batch_size(1).with_linger_ms(1),
    )
    .await
    .unwrap();
    producer
        .send(9, TlvRecord::raw(Bytes::from(vec![0x55u8; 45])))
        .await
        .unwrap();

    let result = consumer.poll().await.unwrap().expect("record not delivered");
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.end_offset, 1074);
    assert_eq!(result.lag(), 0);
    assert_eq!(consumer.current_offset(), 1074);

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn offset_never_regresses_without_seek() {
    let broker = MockBroker::spawn().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new().with_batch_size(1).with_linger_ms(1),
    )
    .await
    .unwrap();
    for i in 0..3 {
        producer
            .send(2, TlvRecord::raw(Bytes::from(format!("msg-{}", i))))
            .await
            .unwrap();
    }

    let mut consumer = StandaloneConsumer::connect(
        "127.0.0.1",
        broker.port,
        ConsumerConfig::new("mono", 2).with_poll_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    let mut last = consumer.current_offset();
    while let Some(result) = consumer.poll().await.unwrap() {
        assert!(result.end_offset >= last);
        last = result.end_offset;
    }
    assert!(last > 0);

    // Only an explicit seek may move the cursor back.
    consumer.seek(0);
    assert_eq!(consumer.current_offset(), 0);
    let replay = consumer.poll().await.unwrap().expect("replay after rewind");
    assert_eq!(replay.records.len(), 3);

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn committed_offset_survives_restart() {
    let broker = MockBroker::spawn().await;
    let offset_dir = tempfile::TempDir::new().unwrap();

    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new().with_batch_size(1).with_linger_ms(1),
    )
    .await
    .unwrap();
    producer
        .send(6, TlvRecord::raw(Bytes::from_static(b"first")))
        .await
        .unwrap();

    let committed = {
        let mut consumer = StandaloneConsumer::connect(
            "127.0.0.1",
            broker.port,
            ConsumerConfig::new("durable", 6)
                .with_offset_dir(offset_dir.path())
                .with_poll_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let result = consumer.poll().await.unwrap().expect("no records");
        assert_eq!(result.records.len(), 1);
        consumer.commit().unwrap();
        let committed = consumer.committed_offset();
        consumer.close().await.unwrap();
        committed
    };
    assert!(committed > 0);

    // A restarted consumer resumes from the persisted offset, not Beginning.
    let mut restarted = StandaloneConsumer::connect(
        "127.0.0.1",
        broker.port,
        ConsumerConfig::new("durable", 6)
            .with_offset_dir(offset_dir.path())
            .with_poll_timeout(Duration::from_millis(300)),
    )
    .await
    .unwrap();
    assert_eq!(restarted.current_offset(), committed);
    assert!(restarted.poll().await.unwrap().is_none(), "already-consumed data replayed");

    // New data past the committed offset is still delivered.
    producer
        .send(6, TlvRecord::raw(Bytes::from_static(b"second")))
        .await
        .unwrap();
    let next = restarted.poll().await.unwrap().expect("new record not delivered");
    assert_eq!(next.records[0].value.as_ref(), b"second");

    producer.close().await.unwrap();
    restarted.close().await.unwrap();
}

#[tokio::test]
async fn commit_to_server_acknowledges_offset() {
    let broker = MockBroker::spawn().await;
    let producer = Producer::connect(
        "127.0.0.1",
        broker.port,
        ProducerConfig::new().with_batch_size(1).with_linger_ms(1),
    )
    .await
    .unwrap();
    producer
        .send(8, TlvRecord::raw(Bytes::from_static(b"x")))
        .await
        .unwrap();

    let mut consumer = StandaloneConsumer::connect(
        "127.0.0.1",
        broker.port,
        ConsumerConfig::new("remote", 8).with_poll_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap();
    consumer.poll().await.unwrap().expect("no records");

    let acked = consumer.commit_to_server().await.unwrap();
    assert_eq!(acked, consumer.committed_offset());

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
}

// ============================================================================
// Reconnect policy
// ============================================================================

#[tokio::test]
async fn bounded_reconnect_attempts_end_closed() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let transport = Transport::start(
        "127.0.0.1",
        port,
        TransportConfig {
            connect_timeout: Duration::from_millis(500),
            auto_reconnect: true,
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 2,
                jitter: 0.0,
            },
            ..Default::default()
        },
    );

    assert!(transport.wait_ready().await.is_err());
    assert_eq!(transport.state(), ConnState::Closed);
}

#[tokio::test]
async fn unbounded_reconnect_never_closes() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let transport = Transport::start(
        "127.0.0.1",
        port,
        TransportConfig {
            connect_timeout: Duration::from_millis(200),
            auto_reconnect: true,
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 0,
                jitter: 0.2,
            },
            ..Default::default()
        },
    );

    // Plenty of failed attempts later, the transport is still trying.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_ne!(transport.state(), ConnState::Closed);
    transport.close().await.unwrap();
}
