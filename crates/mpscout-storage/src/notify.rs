//! Chat webhook notification for newly committed listings.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mpscout_core::ListingRecord;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookClientConfig {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http status {status}")]
    HttpStatus { status: u16 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &ListingRecord) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _record: &ListingRecord) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// An endpoint counts as configured when it is non-empty and not a `YOUR...` placeholder.
pub fn webhook_is_configured(url: &str) -> bool {
    let url = url.trim();
    !url.is_empty() && !url.contains("YOUR")
}

pub fn slack_payload(record: &ListingRecord) -> JsonValue {
    let text = format!(
        "*{}*\nPrice: *{}*\nLocation: {}\nPosted: {}\nLink: {}",
        record.title, record.price, record.location, record.post_time_str, record.link
    );
    json!({
        "text": text,
        "attachments": [{
            "image_url": record.primary_image().unwrap_or_default(),
            "text": "Listing Image",
        }],
    })
}

#[derive(Debug)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    backoff: BackoffPolicy,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, config: WebhookClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            backoff: config.backoff,
        })
    }

    async fn post_with_retry(&self, payload: &JsonValue) -> Result<(), NotifyError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.post(&self.webhook_url).json(payload).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    if !(can_retry && classify_status(status) == RetryDisposition::Retryable) {
                        return Err(NotifyError::HttpStatus {
                            status: status.as_u16(),
                        });
                    }
                    debug!(attempt, %status, "webhook rejected notification; retrying");
                }
                Err(err) => {
                    if !(can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(NotifyError::Request(err));
                    }
                    debug!(attempt, error = %err, "webhook unreachable; retrying");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, record: &ListingRecord) -> Result<(), NotifyError> {
        let payload = slack_payload(record);
        self.post_with_retry(&payload)
            .instrument(info_span!("slack_notify", listing_id = %record.id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn record(images: Vec<String>) -> ListingRecord {
        ListingRecord {
            id: "31337".to_string(),
            title: "Road bike".to_string(),
            price: "$250".to_string(),
            location: "Denver, CO".to_string(),
            post_time_str: "12 minutes ago".to_string(),
            scraped_at: DateTime::parse_from_rfc3339("2026-03-02T08:30:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            link: "https://www.facebook.com/marketplace/item/31337/".to_string(),
            image_url: images,
        }
    }

    #[test]
    fn payload_carries_title_price_and_first_image() {
        let payload = slack_payload(&record(vec![
            "https://cdn.example/1.jpg".to_string(),
            "https://cdn.example/2.jpg".to_string(),
        ]));
        let text = payload["text"].as_str().expect("text");
        assert!(text.starts_with("*Road bike*\nPrice: *$250*"));
        assert!(text.contains("Location: Denver, CO"));
        assert!(text.contains("Posted: 12 minutes ago"));
        assert!(text.ends_with("Link: https://www.facebook.com/marketplace/item/31337/"));
        assert_eq!(payload["attachments"][0]["image_url"], "https://cdn.example/1.jpg");
        assert_eq!(payload["attachments"][0]["text"], "Listing Image");
    }

    #[test]
    fn payload_without_images_sends_empty_attachment_url() {
        let payload = slack_payload(&record(Vec::new()));
        assert_eq!(payload["attachments"][0]["image_url"], "");
    }

    #[test]
    fn placeholder_webhooks_are_not_configured() {
        assert!(!webhook_is_configured(""));
        assert!(!webhook_is_configured("   "));
        assert!(!webhook_is_configured("https://hooks.slack.com/services/YOUR/WEBHOOK/URL"));
        assert!(webhook_is_configured("https://hooks.slack.com/services/T000/B000/XXXX"));
    }

    #[test]
    fn retryable_statuses() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn noop_notifier_always_succeeds() {
        NoopNotifier.notify(&record(Vec::new())).await.expect("noop");
    }
}
