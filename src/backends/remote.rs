//! Remote recognition backend.
//!
//! Sends the screenshot to a hosted vision model behind an OpenAI-style
//! chat-completions endpoint and returns the model's reply text. Screen
//! content leaves the device here, so the fallback controller only calls this
//! backend once consent is granted.

use super::BackendAdapter;
use crate::capture::Screenshot;
use crate::config::RemoteBackendConfig;
use crate::types::{BackendKind, FailureKind};
use base64::Engine as _;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const ELEMENT_PROMPT: &str = "\
You describe user interfaces for blind users. List every UI element visible in \
this screenshot. For icons without a label, describe what the icon does \
(for example \"settings\", \"close\", \"more options\").\n\
Reply with a JSON array only, one object per element:\n\
[{\"type\": \"button|textbox|link|checkbox|radio|dropdown|text|label|icon|image|container\", \
\"text\": \"visible text or purpose\", \"bbox\": [x1, y1, x2, y2], \
\"confidence\": 0.0-1.0, \"actionable\": true|false}]\n\
Coordinates are pixels in the screenshot. Never leave \"text\" empty.";

/// Remote API backend client
pub struct RemoteApiAdapter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl RemoteApiAdapter {
    /// Build from config; the API key is resolved once here
    pub fn from_config(config: &RemoteBackendConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            warn!(
                "No API key for remote backend (set {} or backends.remote.api_key)",
                config.api_key_env
            );
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn build_payload(&self, screenshot: &Screenshot) -> Result<Value, FailureKind> {
        let png = screenshot
            .to_png_bytes()
            .map_err(|e| FailureKind::TransientError(format!("Failed to encode image: {}", e)))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);

        Ok(json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": ELEMENT_PROMPT },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/png;base64,{}", encoded) }
                    }
                ]
            }],
            "temperature": 0.1,
            "max_tokens": 2048
        }))
    }
}

#[async_trait::async_trait]
impl BackendAdapter for RemoteApiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteApi
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn ready(&self) -> bool {
        self.api_key.is_some()
    }

    async fn run_model(
        &self,
        screenshot: &Screenshot,
        deadline: Duration,
    ) -> Result<String, FailureKind> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FailureKind::Unavailable("no API key configured".to_string()))?;

        let payload = self.build_payload(screenshot)?;
        info!(
            "Sending {}x{} screenshot to {}",
            screenshot.width(),
            screenshot.height(),
            self.model
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(deadline)
            .json(&payload)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_request_error)?;
        debug!("Remote backend replied {} ({} bytes)", status, body.len());

        check_status(status, &body)?;
        extract_content(&body)
    }
}

fn map_request_error(e: reqwest::Error) -> FailureKind {
    if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_connect() {
        FailureKind::Unavailable(format!("cannot reach remote backend: {}", e))
    } else {
        FailureKind::TransientError(e.to_string())
    }
}

/// Rate limits and server errors are worth another backend; auth and request
/// errors mean this backend will not work this session
fn check_status(status: StatusCode, body: &str) -> Result<(), FailureKind> {
    if status.is_success() {
        return Ok(());
    }

    let detail = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(FailureKind::TransientError(detail))
    } else {
        Err(FailureKind::Unavailable(detail))
    }
}

/// Pull `choices[0].message.content` out of a completion body
fn extract_content(body: &str) -> Result<String, FailureKind> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FailureKind::InvalidResponse(format!("completion is not JSON: {}", e)))?;

    value["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| FailureKind::InvalidResponse("completion has no message content".to_string()))
}
