use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use super::http::{prepare_vision_image, response_json_or_error, send_with_transport_retries};
use super::{VisionBackend, VisionRequest, VisionResponse};
use crate::config::GenerationConfig;
use crate::error::GenerationError;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Responses API client.
pub struct OpenAiBackend {
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

impl OpenAiBackend {
    pub fn new(config: &GenerationConfig) -> Self {
        let owns_credentials = config.provider == "openai";
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
                provider: "openai".to_string(),
                env_var: "OPENAI_API_KEY",
            })
    }

    fn payload(&self, request: &VisionRequest) -> Result<Value, GenerationError> {
        let mut content = vec![json!({"type": "input_text", "text": request.user})];
        for image in &request.images {
            if let Some(label) = image.label {
                content.push(json!({"type": "input_text", "text": label}));
            }
            let encoded = prepare_vision_image(&image.path, self.image_max_dim)?;
            content.push(json!({
                "type": "input_image",
                "image_url": encoded.data_url(),
            }));
        }
        let mut payload = json!({
            "model": request.model,
            "instructions": request.system,
            "input": [{
                "role": "user",
                "content": content,
            }],
            "max_output_tokens": self.max_output_tokens,
            "temperature": self.temperature,
        });
        if request.expect_json {
            payload["text"] = json!({"format": {"type": "json_object"}});
        }
        Ok(payload)
    }
}

impl VisionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn ensure_ready(&self) -> Result<(), GenerationError> {
        self.api_key().map(|_| ())
    }

    fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, GenerationError> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/responses", self.api_base);
        let payload = self.payload(request)?;
        let response = send_with_transport_retries(
            "openai",
            self.transport_retries,
            self.retry_backoff,
            || {
                self.http
                    .post(&endpoint)
                    .bearer_auth(api_key)
                    .header(CONTENT_TYPE, "application/json")
                    .timeout(self.timeout)
                    .json(&payload)
                    .send()
            },
        )?;
        let parsed = response_json_or_error("openai", response)?;
        let text = extract_openai_output_text(&parsed);
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse {
                provider: "openai".to_string(),
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

fn extract_openai_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            if matches!(kind, "output_text" | "text") {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
                continue;
            }
            if kind != "message" {
                continue;
            }
        }
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let Some(chunk_obj) = chunk.as_object() else {
                continue;
            };
            let kind = chunk_obj
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !matches!(kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk_obj.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }
    parts.join("\n")
}
