// src/inference.rs
//
// Image generation jobs on a Replicate-compatible predictions API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GenerationError;

pub const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_OUTPUT_FORMAT: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub image_data_uri: Option<String>,
    pub fallback_image_url: Option<String>,
    pub output_format: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            image_data_uri: None,
            fallback_image_url: None,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
        }
    }

    pub fn with_inline_image(mut self, data: &[u8], content_type: &str) -> Self {
        self.image_data_uri = Some(format!("data:{};base64,{}", content_type, STANDARD.encode(data)));
        self
    }

    pub fn with_fallback_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_image_url = Some(url.into());
        self
    }

    /// Image sources in the order the provider should try them.
    pub fn image_inputs(&self) -> Vec<&str> {
        self.image_data_uri
            .iter()
            .chain(self.fallback_image_url.iter())
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Single(String),
    Many(Vec<String>),
}

impl JobOutput {
    pub fn first_url(&self) -> Option<&str> {
        match self {
            JobOutput::Single(url) => Some(url.as_str()),
            JobOutput::Many(urls) => urls.first().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    #[serde(default)]
    pub output: Option<JobOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Starts a job and returns its id.
    async fn create_job(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, GenerationError>;

    /// Fetches a finished output asset.
    async fn download(&self, url: &str) -> Result<GeneratedAsset, GenerationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

/// Submits a job and waits for it under a `PollPolicy`.
#[derive(Clone)]
pub struct InferenceJobClient {
    provider: Arc<dyn InferenceProvider>,
    policy: PollPolicy,
}

impl InferenceJobClient {
    pub fn new(provider: Arc<dyn InferenceProvider>, policy: PollPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Runs the job to a terminal state and returns the output asset URL.
    pub async fn submit(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::ProviderFailure("prompt is empty".into()));
        }

        let job_id = self.provider.create_job(request).await?;
        log::info!("generation job created job_id={} model={}", job_id, request.model);

        for attempt in 1..=self.policy.max_attempts {
            let status = self.provider.job_status(&job_id).await?;

            match status.status {
                JobState::Succeeded => {
                    log::info!("generation job succeeded job_id={} attempt={}", job_id, attempt);
                    return status
                        .output
                        .as_ref()
                        .and_then(JobOutput::first_url)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            GenerationError::ProviderFailure("job succeeded without output".into())
                        });
                }
                JobState::Failed | JobState::Canceled => {
                    log::warn!(
                        "generation job ended job_id={} state={:?} error={:?}",
                        job_id,
                        status.status,
                        status.error
                    );
                    return Err(match status.error {
                        Some(message) => GenerationError::from_provider_message(message),
                        None => GenerationError::ProviderFailure(format!(
                            "job {:?}",
                            status.status
                        )),
                    });
                }
                _ => {}
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        log::warn!(
            "generation job timed out job_id={} attempts={}",
            job_id,
            self.policy.max_attempts
        );
        Err(GenerationError::Timeout {
            attempts: self.policy.max_attempts,
        })
    }

    pub async fn download(&self, url: &str) -> Result<GeneratedAsset, GenerationError> {
        self.provider.download(url).await
    }
}

#[derive(Debug, Deserialize)]
struct CreatedPrediction {
    id: String,
}

pub struct ReplicateClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl ReplicateClient {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }
}

fn provider_failure(context: &str, e: reqwest::Error) -> GenerationError {
    GenerationError::ProviderFailure(format!("{context}: {e}"))
}

fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(Value::as_str)
                .or_else(|| v.get("detail").and_then(Value::as_str))
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl InferenceProvider for ReplicateClient {
    async fn create_job(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut input = json!({
            "prompt": request.prompt,
            "output_format": request.output_format,
        });
        let images = request.image_inputs();
        if !images.is_empty() {
            input["image_input"] = json!(images);
        }

        let resp = self
            .http
            .post(format!("{}/predictions", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&json!({ "version": request.model, "input": input }))
            .send()
            .await
            .map_err(|e| provider_failure("create prediction", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| provider_failure("read prediction", e))?;

        if !status.is_success() {
            let message = error_message_from_body(&body);
            return Err(GenerationError::from_provider_message(format!(
                "create prediction status={} {}",
                status.as_u16(),
                message
            )));
        }

        serde_json::from_str::<CreatedPrediction>(&body)
            .map(|p| p.id)
            .map_err(|e| GenerationError::ProviderFailure(format!("parse error: {e}; body={body}")))
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, GenerationError> {
        let resp = self
            .http
            .get(format!("{}/predictions/{}", self.base_url, job_id))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| provider_failure("poll prediction", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| provider_failure("read prediction status", e))?;

        if !status.is_success() {
            return Err(GenerationError::ProviderFailure(format!(
                "poll prediction status={} body={}",
                status.as_u16(),
                body
            )));
        }

        serde_json::from_str::<JobStatus>(&body)
            .map_err(|e| GenerationError::ProviderFailure(format!("parse error: {e}; body={body}")))
    }

    async fn download(&self, url: &str) -> Result<GeneratedAsset, GenerationError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| provider_failure("download output", e))?;

        if !resp.status().is_success() {
            return Err(GenerationError::ProviderFailure(format!(
                "download output status={}",
                resp.status()
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"))
            .unwrap_or_else(|| "image/png".to_string());

        let data = resp
            .bytes()
            .await
            .map_err(|e| provider_failure("download output body", e))?;

        Ok(GeneratedAsset {
            data: data.to_vec(),
            content_type,
        })
    }
}
