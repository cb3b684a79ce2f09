//! Platform adapters.
//!
//! Each adapter wraps one messaging platform behind the same capability
//! set: resolve an identifier to a canonical target id, send an observable
//! probe, and stream delivery receipts back. Receipt matching against
//! platform-specific envelopes lives entirely inside the adapter; the
//! scheduler only ever sees `(token, delivered_at_ms)` pairs.

mod signal;
mod whatsapp;

pub use signal::SignalAdapter;
pub use whatsapp::WhatsappAdapter;

use std::collections::{HashSet, VecDeque};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Signal,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Signal => "signal",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "whatsapp" => Ok(Channel::Whatsapp),
            "signal" => Ok(Channel::Signal),
            other => Err(anyhow!("unknown channel {other}")),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which observable side-effect a probe uses. All variants are invisible
/// or near-invisible to the target; what matters is the delivery receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Delete,
    Reaction,
    Message,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Delete => "delete",
            ProbeMethod::Reaction => "reaction",
            ProbeMethod::Message => "message",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "delete" => Ok(ProbeMethod::Delete),
            "reaction" => Ok(ProbeMethod::Reaction),
            "message" => Ok(ProbeMethod::Message),
            other => Err(anyhow!("unknown probe method {other}")),
        }
    }
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("platform bridge is not available")]
    Unavailable,
    #[error("probe method '{method}' is not supported on {channel}")]
    UnsupportedProbeMethod {
        method: ProbeMethod,
        channel: Channel,
    },
    #[error("invalid target identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("probe send failed: {0}")]
    ProbeFailed(String),
    #[error("bridge transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Returned by a successful `send_probe`. The token is the adapter's handle
/// for matching the eventual delivery receipt; `sent_at_ms` is read from
/// the wall clock before the send call returns.
#[derive(Debug, Clone)]
pub struct ProbeTicket {
    pub token: String,
    pub sent_at_ms: i64,
}

/// One matched delivery acknowledgement.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub token: String,
    pub delivered_at_ms: i64,
}

/// Human-facing attributes for display only; never feeds inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMetadata {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Whether the platform bridge is currently linked and reachable.
    /// Scheduling halts for this channel while this reports false.
    fn is_available(&self) -> bool;

    /// Canonicalize a user-entered identifier into this platform's
    /// target id (digits-only phone number plus platform addressing).
    fn resolve_target(&self, identifier: &str) -> Result<String, AdapterError>;

    async fn send_probe(
        &self,
        target_id: &str,
        method: ProbeMethod,
    ) -> Result<ProbeTicket, AdapterError>;

    /// Lazy, unbounded stream of matched delivery receipts. Restartable
    /// (each call opens a fresh feed) but not replayable; at most one
    /// receipt is ever emitted per probe token.
    fn subscribe_receipts(&self) -> mpsc::UnboundedReceiver<Receipt>;

    async fn get_display_metadata(
        &self,
        target_id: &str,
    ) -> Result<Option<DisplayMetadata>, AdapterError>;
}

/// Strip an identifier down to its digits.
pub(crate) fn normalize_phone(identifier: &str) -> Result<String, AdapterError> {
    let digits: String = identifier.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(AdapterError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(digits)
}

const DEDUP_CAPACITY: usize = 1024;

/// Bounded set of already-delivered probe tokens. Guarantees at-most-once
/// receipt delivery per token even when a platform re-sends acks.
pub(crate) struct ReceiptDedup {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ReceiptDedup {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(DEDUP_CAPACITY),
            seen: HashSet::with_capacity(DEDUP_CAPACITY),
        }
    }

    /// Returns true the first time a token is observed.
    pub(crate) fn insert(&mut self, token: &str) -> bool {
        if self.seen.contains(token) {
            return false;
        }
        if self.order.len() == DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(token.to_string());
        self.seen.insert(token.to_string());
        true
    }
}
