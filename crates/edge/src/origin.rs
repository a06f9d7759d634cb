//! Origin boundary for the edge process.
//!
//! The cache and the assignment layer reach the backend exclusively through
//! this trait so edge logic is testable without network access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use adloop_core::errors::ApplicationError;

/// One scored prediction as served from the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub entity_id: String,
    pub score: f64,
    pub model_version: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub variants: Vec<Variant>,
}

#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch_prediction(&self, entity_id: &str) -> Result<Prediction, ApplicationError>;

    async fn fetch_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<ExperimentConfig, ApplicationError>;

    /// Forward one tracking event. Callers fire-and-forget; a lost event is
    /// acceptable, a blocked read path is not.
    async fn publish_event(&self, event: serde_json::Value) -> Result<(), ApplicationError>;
}

pub struct HttpOrigin {
    base_url: String,
    http: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, ApplicationError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|error| ApplicationError::Origin(format!("build http client: {error}")))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), http })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, ApplicationError> {
        let response = self.http.get(&url).send().await.map_err(|error| {
            if error.is_timeout() {
                ApplicationError::Timeout(format!("origin {url}: {error}"))
            } else {
                ApplicationError::Origin(format!("origin {url}: {error}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApplicationError::Origin(format!("origin {url} returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|error| ApplicationError::Origin(format!("decode origin response: {error}")))
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch_prediction(&self, entity_id: &str) -> Result<Prediction, ApplicationError> {
        self.get_json(format!("{}/predictions/{entity_id}", self.base_url)).await
    }

    async fn fetch_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<ExperimentConfig, ApplicationError> {
        self.get_json(format!("{}/experiments/{experiment_id}", self.base_url)).await
    }

    async fn publish_event(&self, event: serde_json::Value) -> Result<(), ApplicationError> {
        let url = format!("{}/events", self.base_url);
        let response =
            self.http.post(&url).json(&event).send().await.map_err(|error| {
                ApplicationError::Origin(format!("origin {url}: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApplicationError::Origin(format!("origin {url} returned {status}")));
        }
        Ok(())
    }
}
