//! Defines the WebSocket message protocol between the browser client and the
//! API server. Control frames are JSON tagged by `type`; audio travels as raw
//! binary frames in both directions (little-endian PCM16).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vocalis_core::chat::ChatMessage;

/// How the assistant's reply is delivered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Voice,
    Text,
}

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replaces the session's system prompt.
    SetSystemPrompt { content: String },
    /// Drops every non-system message from the history.
    ClearChat,
    /// Replaces the non-system history with the client's copy.
    SyncHistory { history: Vec<ChatMessage> },
    /// Toggles whether past turns are sent to the generator.
    SetContextMode { enabled: bool },
    /// Toggles image directives for this session.
    SetImagegenMode { enabled: bool },
    /// Stores a character portrait path for the user or assistant.
    SetCharacterImage {
        character_type: String,
        image_path: String,
    },
    SetLlmModel { model: String },
    SetLlmHost { host: String },
    SetOutputMode { mode: OutputMode },
    SetTtsEngine { engine: String },
    SetVoice { voice: String },
    GetAvailableVoices,
    /// Cancel the active response outright.
    Interrupt,
    /// Cancel the active response; the client is muting playback.
    StopAudio,
    /// The user began speaking: cancel the response and start recording.
    UserAudioStart,
    /// Recording finished; transcribe and respond.
    UserAudioEnd,
    /// A typed user turn, optionally with a base64-encoded image attachment.
    TextMessage {
        text: String,
        #[serde(default)]
        image: Option<String>,
    },
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Initial configuration pushed right after the connection is accepted.
    Config {
        tts_engine: String,
        llm_model: String,
        output_mode: OutputMode,
    },
    AssistantStart,
    /// A chunk of the streamed reply, image tags already stripped.
    AssistantDelta { delta: String },
    AssistantEnd,
    AssistantCancelled,
    /// Announces one phrase of audio; the PCM follows as a binary frame,
    /// then `audio_end`.
    AudioStart { sample_rate: u32, format: String },
    AudioEnd,
    Transcript { text: String },
    ImageDescribed { description: String },
    ImageGenerating { prompt: String },
    ImageGenerated {
        image: String,
        prompt: String,
        format: String,
    },
    ImageError { error: String, prompt: String },
    /// Generic acknowledgement; carries the field(s) that changed.
    Ack {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    AckRecording { recording: bool },
    Error { message: String },
    ChatCleared,
    TtsEngineChanged { tts_engine: String },
    AvailableVoices {
        voices: Vec<String>,
        current: Option<String>,
    },
    Interrupted,
    AudioStopped,
}

impl ServerMessage {
    /// Builds an `ack` carrying a single changed field.
    pub fn ack(key: &str, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(key.to_string(), value.into());
        ServerMessage::Ack { fields }
    }
}
