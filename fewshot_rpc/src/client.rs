use crate::config::Settings;
use crate::models::{Module, RolloutRequest, RolloutResponse};
use crate::{FewShotError, Result};
use reqwest::{Method, Response};
use serde::Serialize;
use serde_json::Value;

/// HTTP client for the rollout service (`/rollout`, `/send`).
#[derive(Debug, Clone)]
pub struct RolloutClient {
    base_url: String,
    http: reqwest::Client,
}

impl RolloutClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base_url: settings.host_url.trim_end_matches('/').to_string(),
            http: builder.build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<String> {
        let resp = self
            .http
            .request(Method::POST, self.url(path))
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(map_error(resp).await);
        }
        Ok(resp.text().await?)
    }

    /// Runs candidates against examples on the service.
    #[tracing::instrument(level = "debug", skip_all, fields(candidates = req.candidates.len(), examples = req.examples.len(), trace = req.trace))]
    pub async fn rollout(&self, req: &RolloutRequest) -> Result<RolloutResponse> {
        let body = self.post("/rollout", req).await?;
        serde_json::from_str::<RolloutResponse>(&body).map_err(|e| FewShotError::Schema(e.to_string()))
    }

    /// Submits a compiled program. The response body is returned untouched.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn send(&self, program: &Module) -> Result<Value> {
        let body = self.post("/send", program).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body)))
    }
}

async fn map_error(resp: Response) -> FewShotError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    FewShotError::Transport {
        status: Some(status.as_u16()),
        message: if text.is_empty() {
            status.to_string()
        } else {
            text
        },
    }
}
