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
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::utils::clock;

use super::{
    normalize_phone, AdapterError, Channel, DisplayMetadata, PlatformAdapter, ProbeMethod,
    ProbeTicket, Receipt, ReceiptDedup,
};

const SEND_TIMEOUT_SECS: u64 = 12;
const RECONNECT_DELAY_SECS: u64 = 5;

const TARGET_PREFIX: &str = "signal:";

/// Adapter for the signal-cli REST bridge. Sends go through its `/v2/send`
/// and `/v1/remote-delete` endpoints; delivery receipts arrive on the
/// `/v1/receive/{account}` WebSocket feed, keyed by the originating send
/// timestamp.
pub struct SignalAdapter {
    http: reqwest::Client,
    base_url: String,
    /// E.164 number of the linked bridge account. Empty means the bridge
    /// was never linked; the adapter then stays unavailable.
    account: String,
    available: Arc<AtomicBool>,
    receipts_discarded: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct ReceiveFrame {
    envelope: Option<Envelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    receipt_message: Option<ReceiptMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptMessage {
    is_delivery: bool,
    timestamps: Vec<i64>,
    when: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    name: Option<String>,
}

impl SignalAdapter {
    pub fn new(base_url: impl Into<String>, account: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .context("failed to build Signal bridge HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account: account.into(),
            available: Arc::new(AtomicBool::new(false)),
            receipts_discarded: Arc::new(AtomicU64::new(0)),
        })
    }

    fn receive_url(&self) -> String {
        format!(
            "{}/v1/receive/{}",
            self.base_url.replacen("http", "ws", 1),
            self.account
        )
    }

    /// Recipient number for bridge calls, from a canonical target id.
    fn recipient(target_id: &str) -> String {
        format!("+{}", target_id.trim_start_matches(TARGET_PREFIX))
    }
}

#[async_trait]
impl PlatformAdapter for SignalAdapter {
    fn channel(&self) -> Channel {
        Channel::Signal
    }

    fn is_available(&self) -> bool {
        !self.account.is_empty() && self.available.load(Ordering::SeqCst)
    }

    fn resolve_target(&self, identifier: &str) -> Result<String, AdapterError> {
        let digits = normalize_phone(identifier)?;
        Ok(format!("{TARGET_PREFIX}{digits}"))
    }

    async fn send_probe(
        &self,
        target_id: &str,
        method: ProbeMethod,
    ) -> Result<ProbeTicket, AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable);
        }

        let recipient = Self::recipient(target_id);
        let sent_at_ms = clock::now_ms();

        let (endpoint, body) = match method {
            ProbeMethod::Message => (
                "v2/send".to_string(),
                json!({
                    "number": self.account,
                    "recipients": [recipient],
                    "message": "\u{200b}",
                }),
            ),
            ProbeMethod::Delete => {
                // Remote-delete of a timestamp the recipient never had;
                // the envelope still produces a delivery receipt.
                let phantom_ts = sent_at_ms - rand::thread_rng().gen_range(60_000..600_000);
                (
                    format!("v1/remote-delete/{}", self.account),
                    json!({
                        "recipient": recipient,
                        "target_timestamp": phantom_ts,
                    }),
                )
            }
            ProbeMethod::Reaction => {
                return Err(AdapterError::UnsupportedProbeMethod {
                    method,
                    channel: Channel::Signal,
                });
            }
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
            token: ack.timestamp.to_string(),
            sent_at_ms,
        })
    }

    fn subscribe_receipts(&self) -> mpsc::UnboundedReceiver<Receipt> {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.account.is_empty() {
            warn!("Signal account not configured; receipt feed disabled");
            return rx;
        }

        let receive_url = self.receive_url();
        let available = Arc::clone(&self.available);
        let discarded = Arc::clone(&self.receipts_discarded);

        tokio::spawn(async move {
            let mut dedup = ReceiptDedup::new();
            loop {
                match async_tungstenite::tokio::connect_async(&receive_url).await {
                    Ok((stream, _)) => {
                        info!("Connected to Signal bridge receive feed");
                        available.store(true, Ordering::SeqCst);

                        let (_sink, mut frames) = stream.split();
                        while let Some(frame) = frames.next().await {
                            match frame {
                                Ok(tungstenite::Message::Text(text)) => {
                                    let parsed =
                                        serde_json::from_str::<ReceiveFrame>(text.as_str());
                                    let receipt_message = match parsed {
                                        Ok(frame) => frame
                                            .envelope
                                            .and_then(|envelope| envelope.receipt_message),
                                        Err(err) => {
                                            discarded.fetch_add(1, Ordering::Relaxed);
                                            debug!("Discarding malformed bridge frame: {err}");
                                            continue;
                                        }
                                    };

                                    let Some(message) = receipt_message else {
                                        continue;
                                    };
                                    if !message.is_delivery {
                                        continue;
                                    }

                                    let delivered_at_ms =
                                        message.when.unwrap_or_else(clock::now_ms);
                                    for send_timestamp in message.timestamps {
                                        let token = send_timestamp.to_string();
                                        if !dedup.insert(&token) {
                                            debug!("Duplicate delivery receipt for {token}");
                                            continue;
                                        }
                                        let receipt = Receipt {
                                            token,
                                            delivered_at_ms,
                                        };
                                        if tx.send(receipt).is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(tungstenite::Message::Close(_)) => break,
                                Ok(_) => {}
                                Err(err) => {
                                    warn!("Signal bridge feed error: {err}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("Signal bridge feed unavailable: {err}");
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
        let recipient = Self::recipient(target_id);
        let response = self
            .http
            .get(format!("{}/v1/profiles/{recipient}", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let profile: ProfileResponse = response.json().await?;
        Ok(Some(DisplayMetadata {
            display_name: profile.name,
            avatar_url: None,
        }))
    }
}
