//! Delivery to receiver endpoints.
//!
//! Every transport answers a send with a [`RetryToken`]: `None` when the
//! receiver confirmed delivery, `AllItems` when nothing can be assumed
//! delivered, `Items` when the receiver named the items it rejected. The
//! [`Dispatcher`] turns transport errors and timeouts into `AllItems` so
//! callers only ever deal with tokens.

pub mod file_drop;
pub mod nats;
pub mod rest;
pub mod retry;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use file_drop::FileDropTransport;
pub use nats::{NatsPublisher, ReportEnvelope};
pub use rest::RestTransport;
pub use retry::{PendingRetry, RetryPolicy};

/// Default time allowed for one send.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What still needs to be sent after a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum RetryToken {
    /// Delivered.
    None,
    /// Nothing is known to be delivered.
    AllItems,
    /// Only these item positions were rejected.
    Items(BTreeSet<usize>),
}

impl RetryToken {
    /// Build an item-level token, keeping only indices inside `0..item_count`.
    ///
    /// No usable index, or every index, collapses to `AllItems`.
    pub fn for_items(indices: impl IntoIterator<Item = usize>, item_count: usize) -> Self {
        let items: BTreeSet<usize> = indices.into_iter().filter(|i| *i < item_count).collect();
        if items.is_empty() || items.len() == item_count {
            RetryToken::AllItems
        } else {
            RetryToken::Items(items)
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, RetryToken::None)
    }

    /// Re-check an `Items` token against the batch it came from.
    pub fn normalize(self, item_count: usize) -> Self {
        match self {
            RetryToken::Items(items) => RetryToken::for_items(items, item_count),
            other => other,
        }
    }

    /// Item positions that need resending.
    pub fn pending_items(&self, item_count: usize) -> Vec<usize> {
        match self {
            RetryToken::None => Vec::new(),
            RetryToken::AllItems => (0..item_count).collect(),
            RetryToken::Items(items) => items.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

/// One payload bound for one receiver.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest<'a> {
    pub report_id: Uuid,
    pub receiver: &'a str,
    pub content: &'a str,
    pub content_type: &'a str,
    /// Number of items (messages) in `content`; a single message is 1.
    pub item_count: usize,
}

/// A delivery channel to one receiver endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the payload. Errors mean the outcome is unknown.
    async fn send(&self, request: &SendRequest<'_>) -> Result<RetryToken, TransportError>;

    /// Short name used in logs.
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestConfig {
    pub url: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDropConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsTransportConfig {
    /// Server URL; falls back to the hub's NATS URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: String,
    pub subject: String,
}

fn default_stream() -> String {
    "REPORTS".to_string()
}

/// Receiver transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Rest(RestConfig),
    FileDrop(FileDropConfig),
    Nats(NatsTransportConfig),
    /// Accepts everything; used for receivers that only need lineage.
    Null,
}

/// Accepts every payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, request: &SendRequest<'_>) -> Result<RetryToken, TransportError> {
        debug!(report_id = %request.report_id, receiver = request.receiver, "null transport accepted report");
        Ok(RetryToken::None)
    }

    fn kind(&self) -> &'static str {
        "null"
    }
}

/// Sends payloads through the transport a receiver is configured with.
///
/// The HTTP client and NATS connections are shared across sends.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    nats_url: String,
    publishers: std::sync::Arc<DashMap<String, NatsPublisher>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(nats::default_url())
    }
}

impl Dispatcher {
    pub fn new(nats_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            nats_url: nats_url.into(),
            publishers: Default::default(),
        }
    }

    /// Deliver one payload and report what is left to resend.
    ///
    /// Never fails: configuration errors, transport errors and timeouts all
    /// come back as `AllItems`. An `Items` token only holds indices below
    /// `request.item_count`.
    pub async fn send(
        &self,
        config: &TransportConfig,
        request: &SendRequest<'_>,
        timeout: Duration,
    ) -> RetryToken {
        let attempt = async {
            let transport = self.transport_for(config).await?;
            let token = transport.send(request).await?;
            Ok::<_, TransportError>((transport.kind(), token))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok((kind, token))) => {
                let token = token.normalize(request.item_count);
                info!(
                    report_id = %request.report_id,
                    receiver = request.receiver,
                    transport = kind,
                    outcome = ?token,
                    "delivery attempt finished"
                );
                token
            }
            Ok(Err(error)) => {
                warn!(
                    report_id = %request.report_id,
                    receiver = request.receiver,
                    %error,
                    "delivery failed"
                );
                RetryToken::AllItems
            }
            Err(_) => {
                warn!(
                    report_id = %request.report_id,
                    receiver = request.receiver,
                    timeout_ms = timeout.as_millis() as u64,
                    "delivery timed out"
                );
                RetryToken::AllItems
            }
        }
    }

    async fn transport_for(
        &self,
        config: &TransportConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(match config {
            TransportConfig::Rest(rest) => {
                Box::new(RestTransport::with_client(self.http.clone(), rest.clone()))
            }
            TransportConfig::FileDrop(file_drop) => {
                Box::new(FileDropTransport::new(file_drop.directory.clone()))
            }
            TransportConfig::Nats(nats) => Box::new(self.publisher(nats).await?),
            TransportConfig::Null => Box::new(NullTransport),
        })
    }

    async fn publisher(&self, config: &NatsTransportConfig) -> Result<NatsPublisher, TransportError> {
        let url = config.url.clone().unwrap_or_else(|| self.nats_url.clone());
        let key = format!("{url}#{}#{}", config.stream, config.subject);
        if let Some(publisher) = self.publishers.get(&key) {
            return Ok(publisher.clone());
        }
        let publisher = NatsPublisher::connect(&url, config).await?;
        self.publishers.insert(key, publisher.clone());
        Ok(publisher)
    }
}
