//! Optional text-generation enrichment. Every caller treats an error here
//! as soft and substitutes a locally derived value.

pub mod http;
pub mod prompt;
pub mod response;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpEnrichmentClient;
pub use response::extract_text;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment is disabled by configuration")]
    Disabled,
    #[error("no enrichment credential is configured")]
    NotConfigured,
    #[error("failed to read enrichment credential: {0}")]
    Credential(String),
    #[error("enrichment request failed: {0}")]
    Transport(String),
    #[error("enrichment endpoint returned HTTP {status}")]
    Status { status: u16, body: String },
    #[error("failed to decode enrichment response: {0}")]
    Decode(String),
    #[error("enrichment response contained no text")]
    EmptyResponse,
    #[error("enrichment worker terminated: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Trimmed text extracted from the response.
    pub text: String,
    /// Response body as received.
    pub raw: String,
}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion, EnrichmentError>;
}

/// Client used when enrichment is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledEnrichment;

#[async_trait]
impl EnrichmentClient for DisabledEnrichment {
    async fn complete(&self, _prompt: &str) -> Result<Completion, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
}
