//! Request/response channel: one POST to the ask endpoint per user submission.

use crate::config::{EndpointConfig, RequestMode};
use crate::protocol::AskRequest;
use reqwest::header::ACCEPT;
use std::time::Duration;

/// Client for the ask endpoint.
#[derive(Clone)]
pub struct HttpChannel {
    url: String,
    mode: RequestMode,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("ask request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ask endpoint returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl HttpChannel {
    pub fn new(config: &EndpointConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: config.url.trim().to_string(),
            mode: config.request_mode,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the ask request and return the raw response body for the adapter.
    pub async fn ask(&self, request: &AskRequest) -> Result<String, HttpError> {
        let builder = self.client.post(&self.url).header(ACCEPT, "application/json");
        let builder = match self.mode {
            RequestMode::Query => builder.query(request).body(""),
            RequestMode::Json => builder.json(request),
        };
        log::debug!("ask: POST {} ({:?})", self.url, self.mode);
        let res = builder.send().await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(HttpError::Status { status, body });
        }
        Ok(body)
    }
}
