//! Per-connection session state.
//!
//! Each WebSocket connection owns exactly one `ConnState`, shared between the
//! receive loop and the active pipeline task behind an `Arc<Mutex<_>>`.
//! Nothing here is visible to other sessions.

use crate::config::Config;
use crate::prompts;
use crate::ws::protocol::OutputMode;
use std::sync::Arc;
use vocalis_core::chat::{ChatMessage, Role};
use vocalis_core::engines::TextGenerator;

/// Recordings shorter than this (~0.1 s of 16 kHz PCM16) are treated as
/// silence and never reach transcription.
pub const MIN_AUDIO_BYTES: usize = 3200;

/// Sample rate of client microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

pub struct ConnState {
    /// Conversation history. Invariant: exactly one system message, always
    /// first.
    pub messages: Vec<ChatMessage>,
    /// Microphone bytes accumulated while `recording` is set.
    pub user_audio: Vec<u8>,
    pub recording: bool,
    /// True only while a phrase of audio is being synthesized or sent.
    pub speaking: bool,
    /// Whether past turns are included in generator calls.
    pub use_context: bool,
    /// Whether image directives are active for this session.
    pub include_imagegen: bool,
    pub llm_model: String,
    pub llm_host: String,
    pub output_mode: OutputMode,
    pub tts_engine_type: String,
    /// Free-text profile fed to the image generator for visual consistency.
    pub character_description: String,
    pub user_character_image: String,
    pub assistant_character_image: String,
    /// The session's text generator handle; replaced wholesale when the
    /// client points the session at a different LLM host.
    pub generator: Arc<dyn TextGenerator>,
}

impl ConnState {
    pub fn new(config: &Config, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            messages: vec![ChatMessage::system(prompts::DEFAULT_SYSTEM_PROMPT)],
            user_audio: Vec::new(),
            recording: false,
            speaking: false,
            use_context: true,
            include_imagegen: true,
            llm_model: config.llm_model.clone(),
            llm_host: config.llm_host.clone(),
            output_mode: OutputMode::Voice,
            tts_engine_type: config.tts_engine.clone(),
            character_description: String::new(),
            user_character_image: String::new(),
            assistant_character_image: String::new(),
            generator,
        }
    }

    /// Replaces the leading system message, restoring the one-system-first
    /// invariant even if a history sync smuggled extra system entries in.
    pub fn replace_system(&mut self, content: impl Into<String>) {
        self.messages.retain(|m| m.role != Role::System);
        self.messages.insert(0, ChatMessage::system(content));
    }

    /// Drops everything except the system message.
    pub fn clear_history(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    /// Replaces the non-system history with the client's copy.
    pub fn sync_history(&mut self, history: Vec<ChatMessage>) {
        let system: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        self.messages = system;
        self.messages
            .extend(history.into_iter().filter(|m| m.role != Role::System));
    }

    /// Appends a user message unless it byte-for-byte duplicates the last
    /// entry (guards against double submission). Returns whether it was
    /// appended.
    pub fn push_user_unless_duplicate(&mut self, content: &str) -> bool {
        if let Some(last) = self.messages.last()
            && last.role == Role::User
            && last.content == content
        {
            return false;
        }
        self.messages.push(ChatMessage::user(content));
        true
    }

    /// Messages for the next generator call: the full history, or just the
    /// system message(s) plus the current turn when context is off.
    pub fn llm_messages(&self, current_turn: &str) -> Vec<ChatMessage> {
        if self.use_context {
            return self.messages.clone();
        }
        let mut messages: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        messages.push(ChatMessage::user(current_turn));
        messages
    }
}
