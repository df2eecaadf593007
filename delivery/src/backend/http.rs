//! HTTP bridge backend adapter
//!
//! Talks to a REST producer gateway (Confluent REST Proxy style): one
//! POST per message, JSON record bodies, offsets committed through a
//! consumer endpoint. Connection-level failures and retryable HTTP
//! statuses map to `Transient`; other rejections are `Terminal` so the
//! core dead-letters them instead of retrying.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use varma_core::{DeliveryError, Headers, Message, RawMessage, SendAck, TopicOffset};

/// Bridge endpoint configuration
#[derive(Debug, Clone)]
pub struct HttpBridgeConfig {
    /// Base URL of the bridge, e.g. `http://localhost:8082`
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Consumer group used for offset commits
    pub consumer_group: String,
}

impl Default for HttpBridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082".to_string(),
            request_timeout: Duration::from_secs(5),
            consumer_group: "varma".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ProduceRequest<'a> {
    key: Option<&'a str>,
    payload: &'a serde_json::Value,
    headers: Vec<(&'a str, &'a str)>,
    correlation_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct ProduceResponse {
    #[serde(default)]
    partition: i32,
    #[serde(default = "default_offset")]
    offset: i64,
}

fn default_offset() -> i64 {
    -1
}

#[derive(Deserialize)]
struct BridgeRecord {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    timestamp: i64,
}

/// Backend adapter for an HTTP producer bridge
pub struct HttpBridgeAdapter {
    client: reqwest::Client,
    base_url: RwLock<String>,
    config: HttpBridgeConfig,
}

impl HttpBridgeAdapter {
    /// Build an adapter for the given bridge
    pub fn new(config: HttpBridgeConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DeliveryError::Terminal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: RwLock::new(config.base_url.clone()),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.read())
    }

    /// Map a non-success HTTP status onto the error taxonomy
    fn status_error(status: reqwest::StatusCode, body: String) -> DeliveryError {
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            DeliveryError::Transient(format!("bridge returned {status}: {body}"))
        } else {
            DeliveryError::Terminal(format!("bridge rejected request ({status}): {body}"))
        }
    }

    fn transport_error(e: reqwest::Error) -> DeliveryError {
        // Connect failures and timeouts are worth retrying
        DeliveryError::Transient(format!("bridge unreachable: {e}"))
    }

    async fn read_error(response: reqwest::Response) -> DeliveryError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::status_error(status, body)
    }
}

#[async_trait]
impl varma_core::BackendAdapter for HttpBridgeAdapter {
    fn name(&self) -> &'static str {
        "http-bridge"
    }

    async fn connect(&self, endpoints: &[String]) -> Result<(), DeliveryError> {
        if let Some(first) = endpoints.first() {
            *self.base_url.write() = first.trim_end_matches('/').to_string();
        }

        let response = self
            .client
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        tracing::info!(base_url = %self.base_url.read(), "connected to http bridge");
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<SendAck, DeliveryError> {
        // The bridge speaks JSON; non-JSON payloads are shipped as a string
        let payload: serde_json::Value = serde_json::from_slice(&message.payload)
            .unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
            });
        let body = ProduceRequest {
            key: message.key.as_deref(),
            payload: &payload,
            headers: message
                .headers
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_str()))
                .collect(),
            correlation_id: message.correlation_id.as_deref(),
        };

        let response = self
            .client
            .post(self.url(&format!("/topics/{}", message.topic)))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let ack: ProduceResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("malformed bridge ack: {e}")))?;
        Ok(SendAck {
            partition: ack.partition,
            offset: ack.offset,
        })
    }

    async fn consume(
        &self,
        topics: &[String],
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, DeliveryError> {
        let mut out = Vec::new();
        for topic in topics {
            let response = self
                .client
                .get(self.url(&format!(
                    "/topics/{topic}/messages?group={}&max_wait_ms={}",
                    self.config.consumer_group,
                    timeout.as_millis()
                )))
                .send()
                .await
                .map_err(Self::transport_error)?;
            if !response.status().is_success() {
                return Err(Self::read_error(response).await);
            }

            let records: Vec<BridgeRecord> = response
                .json()
                .await
                .map_err(|e| DeliveryError::Transient(format!("malformed bridge records: {e}")))?;
            out.extend(records.into_iter().map(|r| {
                let payload = match r.payload {
                    serde_json::Value::String(s) => bytes::Bytes::from(s),
                    other => bytes::Bytes::from(other.to_string()),
                };
                RawMessage {
                    topic: r.topic,
                    partition: r.partition,
                    offset: r.offset,
                    key: r.key,
                    payload,
                    headers: r.headers.into_iter().collect::<Headers>(),
                    timestamp: r.timestamp,
                }
            }));
        }
        Ok(out)
    }

    async fn commit_offsets(&self, offsets: &[TopicOffset]) -> Result<(), DeliveryError> {
        #[derive(Serialize)]
        struct CommitEntry<'a> {
            topic: &'a str,
            partition: i32,
            offset: i64,
        }

        let body: Vec<CommitEntry<'_>> = offsets
            .iter()
            .map(|o| CommitEntry {
                topic: &o.topic,
                partition: o.partition,
                offset: o.offset,
            })
            .collect();

        let response = self
            .client
            .post(self.url(&format!("/groups/{}/offsets", self.config.consumer_group)))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }
}
