//! HTTP adapter for image generation against an OpenAI-compatible
//! `/v1/images/generations` endpoint (DALL-E, or a local diffusion server
//! speaking the same API).

use super::ImageGenerator;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

pub struct HttpImageGenerator {
    url: String,
    api_key: Option<String>,
    model: String,
    size: String,
    client: reqwest::Client,
}

impl HttpImageGenerator {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key,
            model: model.into(),
            size: size.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    b64_json: String,
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, prompt: &str, character: Option<&str>) -> Result<Vec<u8>> {
        // The character profile leads the prompt so the subject stays
        // consistent across every image in a session.
        let full_prompt = match character {
            Some(character) => format!("{character}, {prompt}"),
            None => prompt.to_string(),
        };
        info!(prompt = %full_prompt, model = %self.model, "generating image");

        let mut request = self.client.post(&self.url).json(&json!({
            "model": self.model,
            "prompt": full_prompt,
            "n": 1,
            "size": self.size,
            "response_format": "b64_json",
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("image endpoint returned {status}: {body}");
        }

        let parsed: ImagesResponse = response
            .json()
            .await
            .context("unexpected response from image endpoint")?;
        let datum = parsed
            .data
            .into_iter()
            .next()
            .context("image endpoint returned no images")?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(datum.b64_json)
            .context("image endpoint returned invalid base64")?;
        Ok(bytes)
    }
}
