//! Capability ports for the external engines the pipeline drives.
//!
//! The session orchestration never talks to a model directly; it calls these
//! narrow traits, which are implemented by HTTP adapters in this module
//! (`ollama`, `speech`, `imagegen`) and by fakes in tests. Engine instances
//! are process-wide and shared across sessions, so every implementation must
//! tolerate concurrent callers; any serialization an engine needs (GPU
//! access, model locks) lives behind its own boundary.

pub mod imagegen;
pub mod ollama;
pub mod speech;

use crate::chat::ChatMessage;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

/// A stream of incremental text deltas from a chat completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Transcribes captured microphone audio.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribes raw little-endian 16-bit PCM at the given sample rate.
    async fn transcribe(&self, pcm16le: &[u8], sample_rate: u32) -> Result<String>;
}

/// Streaming chat completion against a language model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Opens a streaming completion for `messages` with the named model.
    ///
    /// The returned stream is a cancellation point: dropping it must abort
    /// the underlying request.
    async fn stream_chat(&self, messages: &[ChatMessage], model: &str) -> Result<TextStream>;
}

/// One synthesized utterance.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub pcm16le: Bytes,
    pub sample_rate: u32,
}

/// Turns a phrase of text into audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<TtsAudio>;

    /// Names of the voices this engine can load.
    fn list_voices(&self) -> Vec<String>;

    /// Makes `voice` the active voice. Returns `false` when the engine does
    /// not know the voice.
    async fn load_voice(&self, voice: &str) -> Result<bool>;

    fn current_voice(&self) -> Option<String>;
}

/// Produces a text description of an image on disk.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, image_path: &Path, prompt: Option<&str>) -> Result<String>;
}

/// Generates an image from a scene prompt, optionally conditioned on a
/// character profile for visual consistency.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns encoded image bytes (PNG unless the engine says otherwise).
    async fn generate(&self, prompt: &str, character: Option<&str>) -> Result<Vec<u8>>;

    /// Asks the engine to drop model weights from memory. Called after a
    /// generation when the deployment runs in low-VRAM mode; a no-op for
    /// engines with nothing to unload.
    async fn release(&self) {}
}
