//! HTTP adapters for speech engines exposing OpenAI-compatible audio APIs
//! (a hosted provider or a local sidecar such as a whisper/piper server).

use super::{SpeechSynthesizer, SpeechToText, TtsAudio};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::debug;

/// Wraps raw 16-bit PCM bytes in a minimal mono WAV container so transcription
/// endpoints that only accept container formats can ingest it.
pub fn pcm_to_wav(pcm16le: &[u8], sample_rate: u32) -> Vec<u8> {
    let channels: u16 = 1;
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let data_len = pcm16le.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm16le.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm16le);
    wav
}

/// Transcription over an OpenAI-compatible `/v1/audio/transcriptions`
/// endpoint.
pub struct HttpSpeechToText {
    url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl HttpSpeechToText {
    pub fn new(url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, pcm16le: &[u8], sample_rate: u32) -> Result<String> {
        let wav = pcm_to_wav(pcm16le, sample_rate);
        debug!(url = %self.url, wav_bytes = wav.len(), "sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("transcription endpoint returned {status}: {body}");
        }
        Ok(response.text().await?.trim().to_string())
    }
}

/// Synthesis over an OpenAI-compatible `/v1/audio/speech` endpoint returning
/// raw PCM16. The voice roster is configured, not discovered; the active
/// voice is just a field on the next request, so switching it never disturbs
/// an in-flight synthesis call.
pub struct HttpSpeechSynthesizer {
    url: String,
    api_key: Option<String>,
    model: String,
    sample_rate: u32,
    voices: Vec<String>,
    current: RwLock<String>,
    client: reqwest::Client,
}

impl HttpSpeechSynthesizer {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        sample_rate: u32,
        voices: Vec<String>,
        default_voice: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key,
            model: model.into(),
            sample_rate,
            voices,
            current: RwLock::new(default_voice.into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<TtsAudio> {
        let voice = self.current.read().expect("voice lock poisoned").clone();
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("speech endpoint returned {status}: {body}");
        }
        let pcm = response.bytes().await?;
        debug!(bytes = pcm.len(), sample_rate = self.sample_rate, "synthesized phrase");
        Ok(TtsAudio {
            pcm16le: pcm,
            sample_rate: self.sample_rate,
        })
    }

    fn list_voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    async fn load_voice(&self, voice: &str) -> Result<bool> {
        if !self.voices.iter().any(|v| v == voice) {
            return Ok(false);
        }
        *self.current.write().expect("voice lock poisoned") = voice.to_string();
        Ok(true)
    }

    fn current_voice(&self) -> Option<String> {
        Some(self.current.read().expect("voice lock poisoned").clone())
    }
}
