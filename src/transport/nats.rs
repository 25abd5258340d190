//! NATS JetStream delivery.
//!
//! Reports are wrapped in a [`ReportEnvelope`] and published to the
//! receiver's subject; a send is delivered once JetStream acknowledges it.

use async_nats::jetstream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{NatsTransportConfig, RetryToken, SendRequest, Transport, TransportError};

/// `NATS_URL` or the local default.
pub fn default_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

/// Report payload plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEnvelope {
    pub report_id: Uuid,
    pub receiver: String,
    pub content_type: String,
    pub body: String,
    pub item_count: usize,
    pub sent_at: DateTime<Utc>,
}

impl ReportEnvelope {
    pub fn from_request(request: &SendRequest<'_>) -> Self {
        Self {
            report_id: request.report_id,
            receiver: request.receiver.to_string(),
            content_type: request.content_type.to_string(),
            body: request.content.to_string(),
            item_count: request.item_count,
            sent_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NatsPublisher {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    subject: String,
}

impl NatsPublisher {
    /// Connect and make sure the stream exists for the configured subject.
    pub async fn connect(url: &str, config: &NatsTransportConfig) -> Result<Self, TransportError> {
        if config.subject.is_empty() {
            return Err(TransportError::InvalidConfig(
                "NATS transport needs a subject".to_string(),
            ));
        }
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Nats(e.to_string()))?;
        tracing::info!("Connected to NATS at {}", url);

        let jetstream = jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                max_age: Duration::from_secs(7 * 24 * 60 * 60),
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Nats(e.to_string()))?;
        tracing::info!("JetStream stream '{}' ready", config.stream);

        Ok(Self {
            client,
            jetstream,
            subject: config.subject.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

#[async_trait]
impl Transport for NatsPublisher {
    async fn send(&self, request: &SendRequest<'_>) -> Result<RetryToken, TransportError> {
        let envelope = ReportEnvelope::from_request(request);
        let payload = serde_json::to_vec(&envelope)?;

        let ack = self
            .jetstream
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| TransportError::Nats(e.to_string()))?;
        ack.await.map_err(|e| TransportError::Nats(e.to_string()))?;

        tracing::debug!(
            "Published report {} to JetStream subject {}",
            envelope.report_id,
            self.subject
        );
        Ok(RetryToken::None)
    }

    fn kind(&self) -> &'static str {
        "nats"
    }
}
