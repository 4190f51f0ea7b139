//! Groupcast Bridge Transport
//!
//! HTTP client for a sidecar messaging bridge: readiness, sends, message
//! lookup, history, and long-polled updates with offset persistence

use anyhow::{anyhow, Result};
use groupcast_config::BridgeConfig;
use groupcast_ipc::{EventBus, InboundMessage, Outbound, Transport};
use groupcast_storage::{keys, load, save, StateStore};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
const CLIENT_RECREATE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub id: String,
    pub chat: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub quoted_text: Option<String>,
    /// Unix seconds, as the bridge reports them.
    #[serde(default)]
    pub timestamp: i64,
}

impl BridgeMessage {
    /// Text used for matching: the body, else a media caption, else the quoted text.
    pub fn extract_text(&self) -> String {
        [&self.text, &self.caption, &self.quoted_text]
            .into_iter()
            .flatten()
            .map(|text| text.trim())
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn into_inbound(self, self_id: Option<&str>) -> InboundMessage {
        let from_self = self.from_me
            || matches!((self_id, self.sender.as_deref()), (Some(own), Some(sender)) if own == sender);
        InboundMessage {
            text: self.extract_text(),
            id: self.id,
            destination: self.chat,
            from_self,
            timestamp: self.timestamp.saturating_mul(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeUpdate {
    pub update_id: i64,
    pub message: Option<BridgeMessage>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    updates: Vec<BridgeUpdate>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<BridgeMessage>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    destination: &'a str,
    content: &'a Outbound,
}

pub struct BridgeTransport {
    client: Client,
    base_url: Url,
    poll_timeout_secs: u64,
    self_id: Option<String>,
    store: Arc<dyn StateStore>,
    event_bus: Option<EventBus>,
}

impl BridgeTransport {
    pub fn new(config: &BridgeConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let mut base_url = Url::parse(config.base_url.trim())
            .map_err(|e| anyhow!("Invalid bridge URL '{}': {}", config.base_url, e))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let poll_timeout_secs = config.poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS);

        Ok(Self {
            client: Self::build_client(poll_timeout_secs)?,
            base_url,
            poll_timeout_secs,
            self_id: config.self_id.clone(),
            store,
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client(poll_timeout_secs: u64) -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(poll_timeout_secs + 30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    /// Bridge URL for `segments`, each percent-encoded as one path segment.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("bridge URL cannot be a base: {}", self.base_url))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn read_offset(&self) -> Option<i64> {
        match load(self.store.as_ref(), keys::BRIDGE_OFFSET) {
            Ok(offset) => offset,
            Err(e) => {
                warn!("Failed to read bridge offset: {}", e);
                None
            }
        }
    }

    fn write_offset(&self, offset: i64) {
        if let Err(e) = save(self.store.as_ref(), keys::BRIDGE_OFFSET, &offset) {
            warn!("Failed to persist bridge offset: {}", e);
        }
    }

    pub async fn get_updates(&self, client: &Client, offset: Option<i64>) -> Result<Vec<BridgeUpdate>> {
        let mut url = self.endpoint(&["updates"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &self.poll_timeout_secs.to_string());
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }

        let parsed: UpdatesResponse = client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("bridge updates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("bridge updates HTTP error: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow!("bridge updates decode failed: {}", e))?;

        Ok(parsed.updates)
    }

    /// Long-poll the bridge and publish inbound messages on the event bus. Never returns.
    pub async fn poll(&self) -> Result<()> {
        let mut offset = self.read_offset();
        info!(offset = ?offset, "Bridge polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at = Instant::now() + CLIENT_RECREATE_INTERVAL;

        loop {
            if Instant::now() >= client_recreate_at {
                debug!("Recreating bridge HTTP client");
                client = Self::build_client(self.poll_timeout_secs)?;
                client_recreate_at = Instant::now() + CLIENT_RECREATE_INTERVAL;
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(updates) => updates,
                Err(err) => {
                    warn!("Bridge polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1);

                if let Some(message) = update.message {
                    self.publish(message);
                }
            }
        }
    }

    fn publish(&self, message: BridgeMessage) {
        let inbound = message.into_inbound(self.self_id.as_deref());
        let Some(bus) = &self.event_bus else {
            return;
        };
        if let Err(e) = bus.publish_message(inbound) {
            debug!("No inbound listener: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl Transport for BridgeTransport {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn is_ready(&self) -> bool {
        let url = match self.endpoint(&["status"]) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Bridge status request failed: {}", e);
                return false;
            }
        };
        match response.error_for_status() {
            Ok(response) => response
                .json::<StatusResponse>()
                .await
                .map(|status| status.ready)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn send(&self, destination: &str, content: &Outbound) -> Result<()> {
        let url = self.endpoint(&["send"])?;
        let parsed: SendResponse = self
            .client
            .post(url)
            .json(&SendRequest {
                destination,
                content,
            })
            .send()
            .await
            .map_err(|e| anyhow!("bridge send request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("bridge send HTTP error: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow!("bridge send decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!(
                "bridge rejected {} to {}: {}",
                content.kind(),
                destination,
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        Ok(())
    }

    async fn resolve_message(&self, id: &str) -> Result<Option<InboundMessage>> {
        let url = self.endpoint(&["messages", id])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("bridge message lookup failed: {}", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let message: BridgeMessage = response
            .error_for_status()
            .map_err(|e| anyhow!("bridge message lookup HTTP error: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow!("bridge message decode failed: {}", e))?;
        Ok(Some(message.into_inbound(self.self_id.as_deref())))
    }

    async fn recent_messages(&self, destination: &str, limit: usize) -> Result<Vec<InboundMessage>> {
        let mut url = self.endpoint(&["chats", destination, "messages"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        let parsed: HistoryResponse = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("bridge history request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("bridge history HTTP error: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow!("bridge history decode failed: {}", e))?;

        let mut messages: Vec<InboundMessage> = parsed
            .messages
            .into_iter()
            .map(|message| message.into_inbound(self.self_id.as_deref()))
            .collect();
        messages.sort_by_key(|message| message.timestamp);
        Ok(messages)
    }
}
