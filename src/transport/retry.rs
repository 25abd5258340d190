//! Retry scheduling for failed deliveries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::RetryToken;
use crate::hl7::{split, FramingError};

/// Delay before each retry, in minutes, and the retry cap.
///
/// Attempts past the end of the schedule reuse its last delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_schedule")]
    pub schedule_minutes: Vec<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_schedule() -> Vec<u64> {
    vec![1, 5, 30, 60, 240]
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            schedule_minutes: default_schedule(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryPolicy {
    /// When retry number `retry` (zero-based) should run, or `None` once the
    /// policy is exhausted.
    pub fn next_retry_at(&self, retry: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if retry >= self.max_retries {
            return None;
        }
        let minutes = self
            .schedule_minutes
            .get(retry as usize)
            .or_else(|| self.schedule_minutes.last())
            .copied()
            .unwrap_or(0);
        Some(now + Duration::minutes(minutes as i64))
    }
}

/// A delivery waiting to be retried.
///
/// `items` are positions in the original payload; a partial retry resends
/// only those and [`PendingRetry::remap`] translates the receiver's answer
/// back to original positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRetry {
    pub report_id: Uuid,
    pub receiver: String,
    pub token: RetryToken,
    pub item_count: usize,
    pub retry: u32,
    pub next_attempt_at: DateTime<Utc>,
}

impl PendingRetry {
    /// Schedule a retry for a failed send. Returns `None` when the token says
    /// delivered or the policy has no retries left.
    pub fn schedule(
        policy: &RetryPolicy,
        report_id: Uuid,
        receiver: &str,
        token: RetryToken,
        item_count: usize,
        retry: u32,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if token.is_delivered() {
            return None;
        }
        let Some(next_attempt_at) = policy.next_retry_at(retry, now) else {
            warn!(%report_id, receiver, retry, "retries exhausted");
            return None;
        };
        Some(Self {
            report_id,
            receiver: receiver.to_string(),
            token: token.normalize(item_count),
            item_count,
            retry,
            next_attempt_at,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }

    /// Original positions being resent.
    pub fn items(&self) -> Vec<usize> {
        self.token.pending_items(self.item_count)
    }

    /// Content for the next attempt: everything for `AllItems`, a re-framed
    /// batch of the failed messages for `Items`.
    pub fn resend_content(&self, content: &str) -> Result<(String, usize), FramingError> {
        match &self.token {
            RetryToken::Items(items) => {
                let indices: Vec<usize> = items.iter().copied().collect();
                Ok((split(content, &indices)?, indices.len()))
            }
            _ => Ok((content.to_string(), self.item_count)),
        }
    }

    /// Translate the token from a resend back to positions in the original payload.
    pub fn remap(&self, token: RetryToken) -> RetryToken {
        match (&self.token, token) {
            (RetryToken::Items(sent), RetryToken::Items(failed)) => {
                let sent: Vec<usize> = sent.iter().copied().collect();
                RetryToken::Items(
                    failed
                        .into_iter()
                        .filter_map(|position| sent.get(position).copied())
                        .collect(),
                )
            }
            (RetryToken::Items(sent), RetryToken::AllItems) => RetryToken::Items(sent.clone()),
            (_, token) => token,
        }
    }

    /// The follow-up retry after another failed attempt, if the policy allows.
    pub fn next(
        &self,
        policy: &RetryPolicy,
        token: RetryToken,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let token = self.remap(token);
        Self::schedule(
            policy,
            self.report_id,
            &self.receiver,
            token,
            self.item_count,
            self.retry + 1,
            now,
        )
    }
}
