//! HTTP POST delivery.
//!
//! Receivers answer with a status code and, optionally, a JSON body naming
//! rejected items either as `{"rejectedItems": [1, 3]}` or as
//! `{"failures": [{"index": 1, "reason": "..."}]}`.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{RestConfig, RetryToken, SendRequest, Transport, TransportError};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiverReply {
    #[serde(default)]
    rejected_items: Vec<usize>,
    #[serde(default)]
    failures: Vec<ItemFailure>,
}

#[derive(Debug, Deserialize)]
struct ItemFailure {
    index: usize,
}

impl ReceiverReply {
    fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    fn rejected(self) -> Vec<usize> {
        self.rejected_items
            .into_iter()
            .chain(self.failures.into_iter().map(|f| f.index))
            .collect()
    }
}

pub struct RestTransport {
    client: Client,
    config: RestConfig,
}

impl RestTransport {
    pub fn new(config: RestConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: RestConfig) -> Self {
        Self { client, config }
    }
}

/// Map a receiver's answer to a retry token.
///
/// 2xx without item failures is delivered; indices past the payload are ignored. 2xx, 400 or 422 naming items is a
/// partial failure. Everything else retries the whole payload.
fn interpret(status: StatusCode, body: &str, item_count: usize) -> RetryToken {
    let rejected = ReceiverReply::parse(body)
        .map(ReceiverReply::rejected)
        .unwrap_or_default();

    if status.is_success() {
        let (known, unknown): (Vec<usize>, Vec<usize>) =
            rejected.into_iter().partition(|i| *i < item_count);
        if !unknown.is_empty() {
            warn!(?unknown, item_count, "receiver named items outside the payload");
        }
        if known.is_empty() {
            RetryToken::None
        } else {
            RetryToken::for_items(known, item_count)
        }
    } else if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY)
        && !rejected.is_empty()
    {
        RetryToken::for_items(rejected, item_count)
    } else {
        RetryToken::AllItems
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn send(&self, request: &SendRequest<'_>) -> Result<RetryToken, TransportError> {
        let mut builder = self
            .client
            .post(&self.config.url)
            .header(CONTENT_TYPE, request.content_type)
            .header("x-report-id", request.report_id.to_string());
        for (key, value) in &self.config.headers {
            builder = builder.header(key, value);
        }

        let response = builder.body(request.content.to_string()).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let token = interpret(status, &body, request.item_count);

        if token.is_delivered() {
            debug!(url = %self.config.url, %status, "receiver accepted report");
        } else {
            warn!(url = %self.config.url, %status, body = %body, "receiver rejected report");
        }
        Ok(token)
    }

    fn kind(&self) -> &'static str {
        "rest"
    }
}
