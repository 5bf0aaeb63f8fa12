use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::ollama_types::{
    is_vision_model, validate_base_url, validate_model_name, VisionChatMessage,
    VisionChatOptions, VisionChatRequest, VisionChatResponse,
};
use super::types::{EvidenceImage, InferenceRequest, RawOutput, ResponseFormat, VisionGateway};
use super::EvidenceError;
use crate::config::GatewayConfig;

/// Longest slice of an error body carried into an error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Vision gateway speaking the Ollama `/api/chat` protocol.
///
/// Works against a local Ollama or any hosted endpoint exposing the same
/// contract; `api_key` is sent as a bearer token when configured.
pub struct OllamaVisionGateway {
    base_url: String,
    model: String,
    api_key: Option<String>,
    keep_alive: Option<String>,
    temperature: f32,
    client: reqwest::blocking::Client,
}

impl OllamaVisionGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, EvidenceError> {
        validate_base_url(&config.base_url, config.local_only)?;
        validate_model_name(&config.model)?;

        if !is_vision_model(&config.model) {
            tracing::warn!(
                model = %config.model,
                "Model is not a known vision model; image inputs may be ignored"
            );
        }

        // No client-wide timeout: every call carries its own deadline.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| EvidenceError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            keep_alive: config.keep_alive.clone(),
            temperature: config.temperature,
            client,
        })
    }

    /// Local Ollama with the default vision model.
    pub fn default_local() -> Result<Self, EvidenceError> {
        Self::new(&GatewayConfig::default())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn map_transport_error(&self, err: reqwest::Error, deadline: Duration) -> EvidenceError {
        if err.is_timeout() {
            EvidenceError::timeout(deadline)
        } else if err.is_connect() {
            EvidenceError::InferenceUnavailable(format!("cannot connect to {}", self.base_url))
        } else {
            EvidenceError::InferenceUnavailable(err.to_string())
        }
    }
}

impl VisionGateway for OllamaVisionGateway {
    fn invoke(
        &self,
        request: &InferenceRequest<'_>,
        deadline: Duration,
    ) -> Result<RawOutput, EvidenceError> {
        let images: Vec<&str> = request
            .images
            .images()
            .into_iter()
            .map(EvidenceImage::base64)
            .collect();

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(VisionChatMessage {
                role: "system",
                content: system,
                images: None,
            });
        }
        messages.push(VisionChatMessage {
            role: "user",
            content: &request.prompt,
            images: Some(images),
        });

        let format = match &request.format {
            ResponseFormat::Json(schema) => Some(schema),
            ResponseFormat::Text => None,
        };

        let body = VisionChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format,
            options: VisionChatOptions {
                temperature: self.temperature,
            },
            keep_alive: self.keep_alive.as_deref(),
        };

        let mut builder = self.client.post(self.chat_url()).timeout(deadline).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .map_err(|e| self.map_transport_error(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let detail: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            let reason = match status.as_u16() {
                401 | 403 => "authentication rejected",
                404 => "model or endpoint not found",
                429 => "quota exceeded",
                _ => "inference service error",
            };
            return Err(EvidenceError::InferenceUnavailable(format!(
                "{reason} (HTTP {}): {detail}",
                status.as_u16()
            )));
        }

        let parsed: VisionChatResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                EvidenceError::timeout(deadline)
            } else {
                EvidenceError::InferenceUnavailable(format!("unreadable response envelope: {e}"))
            }
        })?;

        Ok(RawOutput::Text(parsed.message.content))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ──────────────────────────────────────────────
// MockVisionGateway (testing)
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Json(serde_json::Value),
    Unavailable(String),
}

/// What a `MockVisionGateway` was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: Option<String>,
    pub prompt: String,
    pub image_count: usize,
    pub json_format: bool,
    pub deadline: Duration,
}

/// Deterministic stand-in for the vision model.
///
/// Returns a fixed reply. With `with_latency`, a latency beyond the call's
/// deadline makes the call wait out the deadline and report a timeout, the
/// same way a real gateway gives up.
pub struct MockVisionGateway {
    reply: MockReply,
    model_name: String,
    latency: Duration,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockVisionGateway {
    fn with_reply(reply: MockReply) -> Self {
        Self {
            reply,
            model_name: "mock-vision".to_string(),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn text(response: &str) -> Self {
        Self::with_reply(MockReply::Text(response.to_string()))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::with_reply(MockReply::Json(value))
    }

    pub fn unavailable(reason: &str) -> Self {
        Self::with_reply(MockReply::Unavailable(reason.to_string()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_model(mut self, model_name: &str) -> Self {
        self.model_name = model_name.to_string();
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl VisionGateway for MockVisionGateway {
    fn invoke(
        &self,
        request: &InferenceRequest<'_>,
        deadline: Duration,
    ) -> Result<RawOutput, EvidenceError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                system: request.system.clone(),
                prompt: request.prompt.clone(),
                image_count: request.images.len(),
                json_format: matches!(request.format, ResponseFormat::Json(_)),
                deadline,
            });

        if self.latency > deadline {
            std::thread::sleep(deadline);
            return Err(EvidenceError::timeout(deadline));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        match &self.reply {
            MockReply::Text(text) => Ok(RawOutput::Text(text.clone())),
            MockReply::Json(value) => Ok(RawOutput::Structured(value.clone())),
            MockReply::Unavailable(reason) => {
                Err(EvidenceError::InferenceUnavailable(reason.clone()))
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
