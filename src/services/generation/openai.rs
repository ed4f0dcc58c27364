use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{Credential, GenerationError, GenerationRequest, StructuredGenerator};

/// Structured generation against any OpenAI-compatible chat completions API
pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatibleGenerator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request_body(request: &GenerationRequest) -> Value {
        json!({
            "model": request.options.model,
            "temperature": request.options.temperature,
            "max_tokens": request.options.max_tokens,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.prompt },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "recommendations",
                    "strict": true,
                    "schema": request.schema,
                },
            },
        })
    }

    /// Extracts the structured object from a chat completion response
    fn parse_completion(body: &str) -> Result<Value, GenerationError> {
        let parsed: Value =
            serde_json::from_str(body).map_err(|e| GenerationError::Parse(e.to_string()))?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GenerationError::Parse("missing message content".to_string()))?;
        serde_json::from_str(content).map_err(|e| GenerationError::Parse(e.to_string()))
    }
}

/// Parses a `Retry-After` header value given in seconds
fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

#[async_trait]
impl StructuredGenerator for OpenAiCompatibleGenerator {
    async fn generate_structured(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<Value, GenerationError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&credential.secret)
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            tracing::warn!(key_id = %credential.id, "Provider reported quota exceeded");
            return Err(GenerationError::QuotaExceeded { retry_after });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        Self::parse_completion(&text)
    }
}
