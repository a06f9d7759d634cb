//! Ad-platform client boundary.
//!
//! The executor and the snapshot intake talk to the platform exclusively
//! through these traits so worker logic is testable without network access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use adloop_core::config::PlatformConfig;
use adloop_core::domain::action::{Action, ActionKind};
use adloop_core::domain::snapshot::{EntityId, PerformanceSnapshot};
use adloop_core::errors::ApplicationError;

/// Receipt returned by the platform for a successfully applied change.
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyReceipt {
    pub external_ref: String,
    pub applied_value: Option<Decimal>,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Apply one mutation. The action id travels as the idempotency key so
    /// a retried request cannot double-apply platform-side.
    async fn apply(&self, action: &Action) -> Result<ApplyReceipt, ApplicationError>;

    /// Pull performance rows reported since the watermark.
    async fn fetch_performance(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSnapshot>, ApplicationError>;
}

pub struct HttpPlatformClient {
    base_url: String,
    access_token: SecretString,
    http: reqwest::Client,
}

impl HttpPlatformClient {
    pub fn new(config: &PlatformConfig) -> Result<Self, ApplicationError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ApplicationError::Platform(format!("build http client: {error}")))?;

        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            http,
        })
    }

    fn endpoint_for(kind: ActionKind) -> &'static str {
        match kind {
            ActionKind::BudgetChange => "budget",
            ActionKind::Pause => "pause",
            ActionKind::TargetingChange => "targeting",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    external_ref: String,
}

#[derive(Debug, Deserialize)]
struct PerformanceRow {
    entity_id: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    impressions: u64,
    clicks: u64,
    conversions: u64,
    spend: Decimal,
    revenue: Decimal,
    ctr: f64,
    roas: f64,
    entity_created_at: DateTime<Utc>,
    observed_at: DateTime<Utc>,
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn apply(&self, action: &Action) -> Result<ApplyReceipt, ApplicationError> {
        let url = format!(
            "{}/campaigns/{}/{}",
            self.base_url,
            action.campaign_ref,
            Self::endpoint_for(action.kind)
        );

        let body = serde_json::json!({
            "idempotency_key": action.id.0,
            "value": action.applied_value.or(action.requested_value),
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ApplicationError::Timeout(format!("platform apply {url}: {error}"))
                } else {
                    ApplicationError::Platform(format!("platform apply {url}: {error}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApplicationError::Platform(format!(
                "platform apply {url} returned {status}"
            )));
        }

        let payload: ApplyResponse = response
            .json()
            .await
            .map_err(|error| ApplicationError::Platform(format!("decode apply response: {error}")))?;

        Ok(ApplyReceipt {
            external_ref: payload.external_ref,
            applied_value: action.applied_value.or(action.requested_value),
        })
    }

    async fn fetch_performance(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSnapshot>, ApplicationError> {
        let url = format!("{}/reports/performance", self.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .query(&[("since", since.to_rfc3339())])
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ApplicationError::Timeout(format!("platform report {url}: {error}"))
                } else {
                    ApplicationError::Platform(format!("platform report {url}: {error}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApplicationError::Platform(format!(
                "platform report {url} returned {status}"
            )));
        }

        let rows: Vec<PerformanceRow> = response.json().await.map_err(|error| {
            ApplicationError::Platform(format!("decode performance report: {error}"))
        })?;

        Ok(rows
            .into_iter()
            .map(|row| PerformanceSnapshot {
                entity_id: EntityId(row.entity_id),
                window_start: row.window_start,
                window_end: row.window_end,
                impressions: row.impressions,
                clicks: row.clicks,
                conversions: row.conversions,
                spend: row.spend,
                revenue: row.revenue,
                ctr: row.ctr,
                roas: row.roas,
                entity_created_at: row.entity_created_at,
                observed_at: row.observed_at,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use adloop_core::domain::action::Action;
    use adloop_core::domain::snapshot::PerformanceSnapshot;
    use adloop_core::errors::ApplicationError;

    use super::{ApplyReceipt, PlatformClient};

    /// Records every apply; optionally fails the first N calls.
    pub struct RecordingPlatform {
        pub applied: Mutex<Vec<Action>>,
        pub failures_remaining: Mutex<u32>,
    }

    impl RecordingPlatform {
        pub fn new() -> Self {
            Self { applied: Mutex::new(Vec::new()), failures_remaining: Mutex::new(0) }
        }

        pub fn failing_first(count: u32) -> Self {
            Self { applied: Mutex::new(Vec::new()), failures_remaining: Mutex::new(count) }
        }

        pub fn applied_count(&self) -> usize {
            self.applied.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl PlatformClient for RecordingPlatform {
        async fn apply(&self, action: &Action) -> Result<ApplyReceipt, ApplicationError> {
            {
                let mut failures = self.failures_remaining.lock().expect("lock");
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ApplicationError::Timeout("injected platform timeout".into()));
                }
            }
            let mut applied = self.applied.lock().expect("lock");
            applied.push(action.clone());
            Ok(ApplyReceipt {
                external_ref: format!("ext-{}", applied.len()),
                applied_value: action.applied_value.or(action.requested_value),
            })
        }

        async fn fetch_performance(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<PerformanceSnapshot>, ApplicationError> {
            Ok(Vec::new())
        }
    }
}
