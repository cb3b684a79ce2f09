use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use async_tungstenite::tungstenite;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::utils::clock;

use super::{
    normalize_phone, AdapterError, Channel, DisplayMetadata, PlatformAdapter, ProbeMethod,
    ProbeTicket, Receipt, ReceiptDedup,
};

const SEND_TIMEOUT_SECS: u64 = 8;
const RECONNECT_DELAY_SECS: u64 = 5;

// Bridge ack levels mirror WhatsApp Web: 1 pending, 2 server, 3 device, 4 read.
// Only device delivery (or better) closes a probe.
const ACK_DELIVERED: u8 = 3;

/// Adapter for the external WhatsApp bridge. Probes are sent over its REST
/// API; delivery acks arrive on its `/events` WebSocket feed.
pub struct WhatsappAdapter {
    http: reqwest::Client,
    base_url: String,
    available: Arc<AtomicBool>,
    receipts_discarded: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AckEvent {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    ack: u8,
    #[serde(rename = "t")]
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactResponse {
    name: Option<String>,
    avatar_url: Option<String>,
}

impl WhatsappAdapter {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .context("failed to build WhatsApp bridge HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            available: Arc::new(AtomicBool::new(false)),
            receipts_discarded: Arc::new(AtomicU64::new(0)),
        })
    }

    fn events_url(&self) -> String {
        format!("{}/events", self.base_url.replacen("http", "ws", 1))
    }

    /// Synthetic message id for probe variants that reference a message
    /// the target never saw.
    fn synthetic_message_id() -> String {
        Uuid::new_v4().simple().to_string().to_uppercase()
    }
}

#[async_trait]
impl PlatformAdapter for WhatsappAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn resolve_target(&self, identifier: &str) -> Result<String, AdapterError> {
        let digits = normalize_phone(identifier)?;
        Ok(format!("{digits}@s.whatsapp.net"))
    }

    async fn send_probe(
        &self,
        target_id: &str,
        method: ProbeMethod,
    ) -> Result<ProbeTicket, AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable);
        }

        let sent_at_ms = clock::now_ms();
        let (endpoint, body) = match method {
            ProbeMethod::Delete => (
                "api/revoke",
                json!({ "chatId": target_id, "messageId": Self::synthetic_message_id() }),
            ),
            ProbeMethod::Reaction => (
                "api/react",
                json!({ "chatId": target_id, "messageId": Self::synthetic_message_id(), "emoji": "" }),
            ),
            ProbeMethod::Message => (
                "api/send",
                json!({ "chatId": target_id, "message": "\u{200b}" }),
            ),
        };

        let response = self
            .http
            .post(format!("{}/{endpoint}", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AdapterError::ProbeFailed(format!(
                "bridge returned {}",
                response.status()
            )));
        }

        let ack: SendResponse = response.json().await?;
        Ok(ProbeTicket {
            token: ack.id,
            sent_at_ms,
        })
    }

    fn subscribe_receipts(&self) -> mpsc::UnboundedReceiver<Receipt> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events_url = self.events_url();
        let available = Arc::clone(&self.available);
        let discarded = Arc::clone(&self.receipts_discarded);

        tokio::spawn(async move {
            let mut dedup = ReceiptDedup::new();
            loop {
                match async_tungstenite::tokio::connect_async(&events_url).await {
                    Ok((stream, _)) => {
                        info!("Connected to WhatsApp bridge event feed");
                        available.store(true, Ordering::SeqCst);

                        let (_sink, mut frames) = stream.split();
                        while let Some(frame) = frames.next().await {
                            match frame {
                                Ok(tungstenite::Message::Text(text)) => {
                                    match serde_json::from_str::<AckEvent>(text.as_str()) {
                                        Ok(event)
                                            if event.kind == "message-ack"
                                                && event.ack >= ACK_DELIVERED =>
                                        {
                                            if !dedup.insert(&event.id) {
                                                debug!("Duplicate ack for {}", event.id);
                                                continue;
                                            }
                                            let receipt = Receipt {
                                                token: event.id,
                                                delivered_at_ms: event
                                                    .timestamp_ms
                                                    .unwrap_or_else(clock::now_ms),
                                            };
                                            if tx.send(receipt).is_err() {
                                                return;
                                            }
                                        }
                                        Ok(_) => {}
                                        Err(err) => {
                                            discarded.fetch_add(1, Ordering::Relaxed);
                                            debug!("Discarding malformed bridge frame: {err}");
                                        }
                                    }
                                }
                                Ok(tungstenite::Message::Close(_)) => break,
                                Ok(_) => {}
                                Err(err) => {
                                    warn!("WhatsApp bridge feed error: {err}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("WhatsApp bridge feed unavailable: {err}");
                    }
                }

                available.store(false, Ordering::SeqCst);
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        });

        rx
    }

    async fn get_display_metadata(
        &self,
        target_id: &str,
    ) -> Result<Option<DisplayMetadata>, AdapterError> {
        let response = self
            .http
            .get(format!("{}/api/contacts/{target_id}", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let contact: ContactResponse = response.json().await?;
        Ok(Some(DisplayMetadata {
            display_name: contact.name,
            avatar_url: contact.avatar_url,
        }))
    }
}
