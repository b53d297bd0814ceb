use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use super::http::{prepare_vision_image, response_json_or_error, send_with_transport_retries};
use super::{VisionBackend, VisionRequest, VisionResponse};
use crate::config::GenerationConfig;
use crate::error::GenerationError;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Messages API client.
pub struct AnthropicBackend {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    max_output_tokens: u64,
    temperature: f64,
    image_max_dim: u32,
    transport_retries: usize,
    retry_backoff: Duration,
    http: HttpClient,
}

impl AnthropicBackend {
    pub fn new(config: &GenerationConfig) -> Self {
        let owns_credentials = config.provider == "anthropic";
        Self {
            api_base: owns_credentials
                .then(|| config.api_base.clone())
                .flatten()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: owns_credentials.then(|| config.api_key.clone()).flatten(),
            timeout: config.request_timeout,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            image_max_dim: config.image_max_dim,
            transport_retries: config.transport_retries,
            retry_backoff: config.retry_backoff,
            http: HttpClient::new(),
        }
    }

    fn api_key(&self) -> Result<&str, GenerationError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GenerationError::MissingApiKey {
                provider: "anthropic".to_string(),
                env_var: "ANTHROPIC_API_KEY",
            })
    }

    fn payload(&self, request: &VisionRequest) -> Result<Value, GenerationError> {
        let mut content = Vec::new();
        for image in &request.images {
            if let Some(label) = image.label {
                content.push(json!({"type": "text", "text": label}));
            }
            let encoded = prepare_vision_image(&image.path, self.image_max_dim)?;
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": encoded.mime,
                    "data": encoded.data,
                },
            }));
        }
        content.push(json!({"type": "text", "text": request.user}));
        Ok(json!({
            "model": request.model,
            "system": request.system,
            "max_tokens": self.max_output_tokens,
            "temperature": self.temperature,
            "messages": [{
                "role": "user",
                "content": content,
            }],
        }))
    }
}

impl VisionBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn ensure_ready(&self) -> Result<(), GenerationError> {
        self.api_key().map(|_| ())
    }

    fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, GenerationError> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/messages", self.api_base);
        let payload = self.payload(request)?;
        let response = send_with_transport_retries(
            "anthropic",
            self.transport_retries,
            self.retry_backoff,
            || {
                self.http
                    .post(&endpoint)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", API_VERSION)
                    .header(CONTENT_TYPE, "application/json")
                    .timeout(self.timeout)
                    .json(&payload)
                    .send()
            },
        )?;
        let parsed = response_json_or_error("anthropic", response)?;
        let text = extract_anthropic_text(&parsed);
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse {
                provider: "anthropic".to_string(),
            });
        }
        let model = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();
        Ok(VisionResponse { text, model })
    }
}

fn extract_anthropic_text(response: &Value) -> String {
    response
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .unwrap_or_default()
}
