//! The hosted generative-model capability, consumed as an opaque
//! "structured generation" call, plus the credentials it runs under.

pub mod credentials;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use openai::OpenAiCompatibleGenerator;

/// A provider credential. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub provider: String,
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The credential's quota is exhausted (HTTP 429 or equivalent)
    #[error("quota exceeded")]
    QuotaExceeded {
        retry_after: Option<std::time::Duration>,
    },
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// Schema-constrained generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// JSON schema the output must satisfy
    pub schema: Value,
    pub prompt: String,
    pub system_prompt: String,
    pub options: ProviderOptions,
}

/// Structured generation. Request in, JSON object out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    async fn generate_structured(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<Value, GenerationError>;
}
