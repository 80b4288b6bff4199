//! Ollama HTTP adapters: streaming chat and vision-model image description.

use super::{ImageDescriber, TextGenerator, TextStream};
use crate::chat::ChatMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

/// Client for Ollama's `/api/chat` endpoint.
///
/// The streaming API emits newline-delimited JSON objects, each carrying a
/// partial `message.content`, and closes the response after the final chunk
/// reports `done`.
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into().trim_end_matches('/').to_string();
        Self {
            host,
            client: reqwest::Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pulls the text delta out of one NDJSON line, if it carries one.
fn parse_delta(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let chunk: ChatChunk = serde_json::from_str(line).ok()?;
    chunk
        .message
        .and_then(|m| m.content)
        .filter(|c| !c.is_empty())
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn stream_chat(&self, messages: &[ChatMessage], model: &str) -> Result<TextStream> {
        let url = format!("{}/api/chat", self.host);
        debug!(%url, model, messages = messages.len(), "opening chat stream");

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "model": model,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await
            .context("failed to reach LLM host")?
            .error_for_status()
            .context("LLM host rejected chat request")?;

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());
        let deltas = lines
            .map_err(anyhow::Error::from)
            .try_filter_map(|line| async move { Ok(parse_delta(&line)) });

        Ok(Box::pin(deltas))
    }
}

/// Image description through an Ollama vision model (e.g. llava): the image
/// is sent base64-encoded alongside the prompt in a non-streaming chat call.
pub struct OllamaVision {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaVision {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChunkMessage,
}

#[async_trait]
impl ImageDescriber for OllamaVision {
    async fn describe(&self, image_path: &Path, prompt: Option<&str>) -> Result<String> {
        let image = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("failed to read image {}", image_path.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image);

        let url = format!("{}/api/chat", self.host);
        let response: ChatResponse = self
            .client
            .post(&url)
            .json(&json!({
                "model": self.model,
                "messages": [{
                    "role": "user",
                    "content": prompt.unwrap_or("Describe this image in detail."),
                    "images": [encoded],
                }],
                "stream": false,
            }))
            .send()
            .await
            .context("failed to reach vision model host")?
            .error_for_status()
            .context("vision model rejected describe request")?
            .json()
            .await
            .context("unexpected response from vision model")?;

        let description = response.message.content.unwrap_or_default();
        Ok(description.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_delta_extracts_content() {
        let line = r#"{"model":"m","message":{"role":"assistant","content":"Hi"},"done":false}"#;
        assert_eq!(parse_delta(line).as_deref(), Some("Hi"));
    }

    #[test]
    fn parse_delta_skips_done_marker() {
        let line = r#"{"model":"m","message":{"role":"assistant","content":""},"done":true}"#;
        assert_eq!(parse_delta(line), None);
    }

    #[test]
    fn parse_delta_tolerates_garbage() {
        assert_eq!(parse_delta("not json"), None);
        assert_eq!(parse_delta(""), None);
        assert_eq!(parse_delta(r#"{"done":true}"#), None);
    }

    #[test]
    fn host_trailing_slash_is_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/");
        assert_eq!(client.host(), "http://localhost:11434");
    }
}
