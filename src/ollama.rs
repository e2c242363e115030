use std::io;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use crate::source::{ChunkStream, PromptPayload, TokenSource};

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Streaming token source backed by Ollama's generate endpoint. The
/// response body is NDJSON, one chunk object per line.
#[derive(Clone)]
pub struct OllamaSource {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaSource {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl TokenSource for OllamaSource {
    async fn stream(&self, payload: &PromptPayload) -> Result<ChunkStream> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: payload.user_prompt.clone(),
            stream: true,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Ollama request failed with status: {}. Make sure Ollama is running with: ollama serve",
                response.status()
            ));
        }

        let bytes = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let lines = LinesStream::new(StreamReader::new(bytes).lines());

        let chunks = lines
            .map(|line| match line {
                Ok(line) => parse_line(&line),
                Err(e) => Err(e.into()),
            })
            .filter_map(|item| async move {
                match item {
                    Ok(Some(text)) => Some(Ok(text)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(chunks.boxed())
    }
}

/// Parse one NDJSON line into a text chunk. Blank lines and empty final
/// chunks yield `None`; the session contract promises non-empty chunks.
fn parse_line(line: &str) -> Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: GenerateChunk = serde_json::from_str(line)?;
    if chunk.done {
        debug!("ollama reported done");
    }

    if chunk.response.is_empty() {
        Ok(None)
    } else {
        Ok(Some(chunk.response))
    }
}
