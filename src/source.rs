use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Wire payload handed to the token source for one generation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PromptPayload {
    #[serde(rename = "userPrompt")]
    pub user_prompt: String,
}

impl PromptPayload {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
        }
    }
}

/// Ordered, non-empty text chunks from one generation.
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// Boundary to the inference backend. The session pulls chunks from the
/// returned stream in order; dropping the stream cancels the generation on
/// the transport level, `abort` additionally asks the backend to stop.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn stream(&self, payload: &PromptPayload) -> Result<ChunkStream>;

    /// Best-effort external cancel. Must not fail.
    async fn abort(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_uses_camel_case_wire_name() {
        let json = serde_json::to_string(&PromptPayload::new("hola")).unwrap();
        assert_eq!(json, r#"{"userPrompt":"hola"}"#);
    }
}
