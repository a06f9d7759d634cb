//! HTTP implementations of the model-service boundary.
//!
//! Training and holdout scoring run in the external model service; these
//! clients only move identifiers and per-sample correctness across the wire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use adloop_core::config::PlatformConfig;
use adloop_core::domain::model::{CandidateStatus, ModelCandidate, ModelId};
use adloop_core::errors::ApplicationError;

use crate::evaluator::{HoldoutScorer, HoldoutScores};
use crate::stages::ModelTrainer;

pub struct HttpModelService {
    base_url: String,
    access_token: SecretString,
    http: reqwest::Client,
}

impl HttpModelService {
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

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, ApplicationError> {
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ApplicationError::Timeout(format!("model service {url}: {error}"))
                } else {
                    ApplicationError::Platform(format!("model service {url}: {error}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApplicationError::Platform(format!(
                "model service {url} returned {status}"
            )));
        }

        response.json().await.map_err(|error| {
            ApplicationError::Platform(format!("decode model service response: {error}"))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    champion_correct: Vec<bool>,
    challenger_correct: Vec<bool>,
}

#[async_trait]
impl HoldoutScorer for HttpModelService {
    async fn score(
        &self,
        champion: &ModelId,
        challenger: &ModelId,
    ) -> Result<HoldoutScores, ApplicationError> {
        let url = format!("{}/models/holdout-scores", self.base_url);
        let body = serde_json::json!({
            "champion_id": champion.0,
            "challenger_id": challenger.0,
        });
        let scores: ScoreResponse = self.post_json(url, &body).await?;
        Ok(HoldoutScores {
            champion_correct: scores.champion_correct,
            challenger_correct: scores.challenger_correct,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    model_id: String,
    model_type: String,
}

#[async_trait]
impl ModelTrainer for HttpModelService {
    async fn train(
        &self,
        sample_count: u64,
        now: DateTime<Utc>,
    ) -> Result<ModelCandidate, ApplicationError> {
        let url = format!("{}/models/trainings", self.base_url);
        let body = serde_json::json!({
            "request_id": Uuid::new_v4().to_string(),
            "sample_count": sample_count,
        });
        let trained: TrainResponse = self.post_json(url, &body).await?;
        Ok(ModelCandidate {
            model_id: ModelId(trained.model_id),
            model_type: trained.model_type,
            trained_at: now,
            training_sample_count: sample_count,
            status: CandidateStatus::Candidate,
        })
    }
}
