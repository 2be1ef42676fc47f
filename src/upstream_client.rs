//! Upstream Client: HTTP access to the affiliate racing API.
//!
//! Every fetch is rate-limited, retried with exponential backoff on the
//! retryable classes (network, timeout, 5xx, 429) and bounded by a hard
//! wall-clock budget. Payloads are schema-validated before deserialization
//! so downstream stages only ever see well-formed data.

use crate::settings::Settings;
use crate::types::upstream::{RaceEventPayload, RaceListResponse};
use crate::validation::{self, ValidationFailure};
use anyhow::Result;
use chrono::NaiveDate;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use url::Url;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Fetch exceeded wall-clock budget of {0:?}")]
    Timeout(Duration),
    #[error("Upstream returned HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("Payload validation failed: {0}")]
    Validation(#[from] ValidationFailure),
    #[error("Response body could not be decoded: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Transport-class failures are worth retrying; schema failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Network(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::HttpStatus { status } => *status >= 500 || *status == 429,
            UpstreamError::Validation(_) | UpstreamError::Decode(_) => false,
        }
    }
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: Url,
    retries: u32,
    budget: Duration,
    limiter: Arc<DirectRateLimiter>,
}

impl UpstreamClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let budget = Duration::from_millis(settings.upstream.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(budget)
            .user_agent(settings.upstream.user_agent.clone())
            .build()?;

        // Url::join treats a missing trailing slash as a file segment and
        // would drop the /v1 suffix, so normalize here.
        let mut base = settings.upstream.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;

        // One request per configured delay window throttles the import path
        let burst = NonZeroU32::new(1)
            .ok_or_else(|| anyhow::anyhow!("rate limiter burst must be non-zero"))?;
        let period = Duration::from_millis(settings.upstream.request_delay_ms.max(1));
        let quota = Quota::with_period(period)
            .ok_or_else(|| anyhow::anyhow!("invalid upstream rate limit period"))?
            .allow_burst(burst);

        Ok(Self {
            client,
            base_url,
            retries: settings.upstream.retries,
            budget,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    fn event_url(&self, race_id: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(&format!("racing/event/{}", race_id))
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    fn list_url(&self, date_from: NaiveDate, date_to: NaiveDate) -> Result<Url, UpstreamError> {
        let mut url = self
            .base_url
            .join("racing/list")
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("date_from", &date_from.format("%Y-%m-%d").to_string())
            .append_pair("date_to", &date_to.format("%Y-%m-%d").to_string());
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<serde_json::Value, UpstreamError> {
        self.limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(self.budget)
                } else {
                    UpstreamError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    /// Retry wrapper: exponential backoff with jitter, transport classes only.
    async fn get_json_with_retry(&self, url: Url) -> Result<serde_json::Value, UpstreamError> {
        // 250ms, 500ms, 1s, ... jittered, capped at 5s between attempts
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(125)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.retries as usize);

        let attempt = || {
            let url = url.clone();
            async move { self.get_json(url).await }
        };

        match tokio::time::timeout(
            self.budget,
            RetryIf::spawn(strategy, attempt, UpstreamError::is_retryable),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.budget)),
        }
    }

    /// Fetch and validate one race event payload.
    pub async fn fetch_race(&self, race_id: &str) -> Result<RaceEventPayload, UpstreamError> {
        let url = self.event_url(race_id)?;
        let raw = self.get_json_with_retry(url).await?;

        validation::validate_race_event(&raw)?;

        serde_json::from_value(raw).map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    /// Fetch the day's meetings-with-races window.
    pub async fn list_races_between(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<RaceListResponse, UpstreamError> {
        let url = self.list_url(date_from, date_to)?;
        let raw = self.get_json_with_retry(url).await?;

        validation::validate_race_list(&raw)?;

        serde_json::from_value(raw).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes_follow_the_transport_taxonomy() {
        assert!(UpstreamError::Network("reset".to_string()).is_retryable());
        assert!(UpstreamError::Timeout(Duration::from_secs(15)).is_retryable());
        assert!(UpstreamError::HttpStatus { status: 503 }.is_retryable());
        assert!(UpstreamError::HttpStatus { status: 429 }.is_retryable());
        assert!(!UpstreamError::HttpStatus { status: 404 }.is_retryable());
        assert!(!UpstreamError::Decode("bad json".to_string()).is_retryable());
        assert!(!UpstreamError::Validation(ValidationFailure { errors: vec![] }).is_retryable());
    }

    #[test]
    fn urls_join_against_the_configured_base() {
        let base = Url::parse("https://api.example.test/affiliates/v1/").unwrap();
        let event = base.join("racing/event/R123").unwrap();
        assert_eq!(
            event.as_str(),
            "https://api.example.test/affiliates/v1/racing/event/R123"
        );
    }
}
