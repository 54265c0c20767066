//! Management client: topic operations over a shared transport.
//!
//! ```rust,ignore
//! use lwp_client::{ClientConfig, LwpClient};
//!
//! let client = LwpClient::connect(ClientConfig::new("10.0.10.11", 1992)).await?;
//! let topic = client.create_topic("market-events").await?;
//! client.set_retention(topic.id as u32, 86_400, 0).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use lwp_wire::Frame;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::{Transport, TransportConfig};

/// Topic metadata returned by management operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub created_at_ns: u64,
    /// Maximum record age in seconds (None = no age limit).
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    /// Maximum topic size in bytes (None = no size limit).
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

#[derive(Deserialize)]
struct TopicListBody {
    #[serde(default)]
    topics: Vec<TopicInfo>,
}

/// Management/control client for topic operations.
pub struct LwpClient {
    transport: Arc<Transport>,
    config: ClientConfig,
}

impl LwpClient {
    /// Connect to a broker and complete the handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let transport_config = TransportConfig {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            tls: config.tls.clone(),
            ..Default::default()
        };
        let transport =
            Transport::connect(config.host.clone(), config.port, transport_config).await?;
        Ok(Self { transport, config })
    }

    /// Build a client on an already-connected transport.
    #[must_use]
    pub fn from_transport(transport: Arc<Transport>, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Round-trip a PING and return the latency.
    pub async fn ping(&self) -> Result<Duration> {
        self.transport.ping().await
    }

    /// Create a new topic and return its metadata.
    pub async fn create_topic(&self, name: &str) -> Result<TopicInfo> {
        trace!(topic_name = %name, "creating topic");
        let frame = Frame::create_topic(self.transport.next_correlation(), name);
        let reply = self.transport.request(frame).await?;
        parse_topic(&reply.payload)
    }

    /// Create a topic and apply a retention policy in one call.
    pub async fn create_topic_with_retention(
        &self,
        name: &str,
        max_age_secs: u64,
        max_bytes: u64,
    ) -> Result<TopicInfo> {
        let topic = self.create_topic(name).await?;
        self.set_retention(topic.id as u32, max_age_secs, max_bytes)
            .await?;
        self.get_topic(topic.id as u32).await
    }

    /// Delete a topic by id.
    pub async fn delete_topic(&self, topic_id: u32) -> Result<()> {
        trace!(topic_id, "deleting topic");
        let frame = Frame::delete_topic(self.transport.next_correlation(), topic_id);
        self.transport.request(frame).await?;
        Ok(())
    }

    /// List all topics.
    pub async fn list_topics(&self) -> Result<Vec<TopicInfo>> {
        trace!("listing topics");
        let frame = Frame::list_topics(self.transport.next_correlation());
        let reply = self.transport.request(frame).await?;
        parse_topic_list(&reply.payload)
    }

    /// Get metadata for one topic.
    pub async fn get_topic(&self, topic_id: u32) -> Result<TopicInfo> {
        trace!(topic_id, "getting topic");
        let frame = Frame::get_topic(self.transport.next_correlation(), topic_id);
        let reply = self.transport.request(frame).await?;
        parse_topic(&reply.payload)
    }

    /// Set retention policy for an existing topic (0 disables a limit).
    pub async fn set_retention(
        &self,
        topic_id: u32,
        max_age_secs: u64,
        max_bytes: u64,
    ) -> Result<()> {
        trace!(topic_id, max_age_secs, max_bytes, "setting retention policy");
        let frame = Frame::set_retention(
            self.transport.next_correlation(),
            topic_id,
            max_age_secs,
            max_bytes,
        );
        self.transport.request(frame).await?;
        Ok(())
    }

    /// Drain outstanding requests and close the connection.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

impl std::fmt::Debug for LwpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LwpClient")
            .field("addr", &self.config.address())
            .field("transport", &self.transport)
            .finish()
    }
}

fn parse_topic(payload: &[u8]) -> Result<TopicInfo> {
    if payload.is_empty() {
        return Err(ClientError::InvalidFrame("empty topic response".into()));
    }
    serde_json::from_slice(payload)
        .map_err(|e| ClientError::InvalidFrame(format!("invalid topic metadata: {}", e)))
}

fn parse_topic_list(payload: &[u8]) -> Result<Vec<TopicInfo>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let body: TopicListBody = serde_json::from_slice(payload)
        .map_err(|e| ClientError::InvalidFrame(format!("invalid topic list: {}", e)))?;
    Ok(body.topics)
}
