//! Drives one user turn end to end.
//!
//! A turn streams text from the generator, cuts it into phrases, synthesizes
//! each phrase in order, and finally acts on any image directives embedded in
//! the completed text. The whole run executes as a background task owned by
//! the session's `CancellationController`; every await in here is a
//! cancellation point, and the token is re-checked before each phrase so no
//! audio is emitted after an interrupt.

use crate::prompts;
use crate::state::AppState;
use crate::ws::conn::ConnState;
use crate::ws::protocol::{OutputMode, ServerMessage};
use crate::ws::sink::{EventSink, TransportClosed};
use anyhow::{Context, Result};
use base64::Engine as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vocalis_core::chat::ChatMessage;
use vocalis_core::engines::{ImageDescriber, TextGenerator, TtsAudio};
use vocalis_core::{segment, tags};

/// One user turn handed to the pipeline.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub text: String,
    /// Base64-encoded image attachment, with or without a data-URL prefix.
    pub image_base64: Option<String>,
}

/// How a turn ended. Errors are reported separately; cancellation is not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnStatus {
    Completed,
    Cancelled,
}

/// Word cap applied to optimized image prompts.
const MAX_IMAGE_PROMPT_WORDS: usize = 40;

/// Upper bound on the best-effort terminal send after a turn ends. A client
/// that stopped reading must not pin the task once the turn is over.
const FINAL_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Runs `fut` unless the token fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Sends one event unless cancellation wins the race. Outbound sends are
/// cancellation points too: a client that has stopped reading must not pin
/// the run past an interrupt.
async fn emit(
    sink: &dyn EventSink,
    cancel: &CancellationToken,
    msg: ServerMessage,
) -> Result<TurnStatus> {
    match until_cancelled(cancel, sink.send(msg)).await {
        None => Ok(TurnStatus::Cancelled),
        Some(sent) => sent.map(|_| TurnStatus::Completed),
    }
}

/// Entry point for a spawned pipeline task. Converts the turn's outcome into
/// protocol events and guarantees the speaking flag is reset on every path.
pub async fn run_turn(
    state: Arc<AppState>,
    conn: Arc<Mutex<ConnState>>,
    sink: Arc<dyn EventSink>,
    turn: TurnInput,
    cancel: CancellationToken,
) {
    let result = drive_turn(&state, &conn, sink.as_ref(), turn, &cancel).await;
    conn.lock().await.speaking = false;

    match result {
        Ok(TurnStatus::Completed) => {}
        Ok(TurnStatus::Cancelled) => {
            info!("turn cancelled");
            // The client may be the very reason the run was cancelled (a
            // stalled reader), so the acknowledgement gets a hard bound.
            let _ = tokio::time::timeout(
                FINAL_SEND_TIMEOUT,
                sink.send(ServerMessage::AssistantCancelled),
            )
            .await;
        }
        Err(e) if e.is::<TransportClosed>() => {
            // The socket is gone; nothing further may be sent.
            info!("client transport closed mid-turn");
        }
        Err(e) => {
            error!(error = ?e, "turn failed");
            let _ = tokio::time::timeout(
                FINAL_SEND_TIMEOUT,
                sink.send(ServerMessage::Error {
                    message: e.to_string(),
                }),
            )
            .await;
        }
    }
}

async fn drive_turn(
    state: &AppState,
    conn: &Mutex<ConnState>,
    sink: &dyn EventSink,
    turn: TurnInput,
    cancel: &CancellationToken,
) -> Result<TurnStatus> {
    if cancel.is_cancelled() {
        return Ok(TurnStatus::Cancelled);
    }

    // Step 1: fold an attached image into the user text. The generator only
    // ever sees text.
    let mut content = if turn.text.is_empty() {
        prompts::DEFAULT_IMAGE_QUESTION.to_string()
    } else {
        turn.text.clone()
    };
    if let Some(image_b64) = &turn.image_base64 {
        match &state.engines.describer {
            Some(describer) => {
                let Some(described) = until_cancelled(
                    cancel,
                    describe_attachment(state, describer.as_ref(), image_b64, &content),
                )
                .await
                else {
                    return Ok(TurnStatus::Cancelled);
                };
                match described {
                    Ok(description) => {
                        let event = ServerMessage::ImageDescribed {
                            description: description.clone(),
                        };
                        if let TurnStatus::Cancelled = emit(sink, cancel, event).await? {
                            return Ok(TurnStatus::Cancelled);
                        }
                        content.push_str(&format!(
                            "\n\n[The user attached an image with the following description: {description}]"
                        ));
                    }
                    Err(e) => {
                        warn!(error = ?e, "failed to describe attached image");
                        if turn.text.is_empty() {
                            content =
                                "I sent you an image, but it couldn't be processed.".to_string();
                        } else {
                            content.push_str("\n\n[Note: the attached image could not be processed]");
                        }
                    }
                }
            }
            None => {
                warn!("image received but no describer is configured");
                content.push_str(
                    "\n\n[Note: An image was attached but image explanation is not available]",
                );
            }
        }
    }

    // Step 2: history update and a snapshot of what this turn needs.
    let (llm_messages, generator, model) = {
        let mut conn = conn.lock().await;
        conn.push_user_unless_duplicate(&content);
        (
            conn.llm_messages(&content),
            conn.generator.clone(),
            conn.llm_model.clone(),
        )
    };

    if let TurnStatus::Cancelled = emit(sink, cancel, ServerMessage::AssistantStart).await? {
        return Ok(TurnStatus::Cancelled);
    }

    // Step 3: the generation loop. Text accumulates in `full` for the
    // directive pass and in `buf` for phrase segmentation.
    let Some(stream) = until_cancelled(cancel, generator.stream_chat(&llm_messages, &model)).await
    else {
        return Ok(TurnStatus::Cancelled);
    };
    let mut stream = stream?;

    let mut full = String::new();
    let mut buf = String::new();
    use futures_util::StreamExt;
    loop {
        let Some(next) = until_cancelled(cancel, stream.next()).await else {
            return Ok(TurnStatus::Cancelled);
        };
        let Some(delta) = next else { break };
        let delta = delta.context("text generation stream failed")?;

        full.push_str(&delta);
        buf.push_str(&delta);

        // The transcript keeps paralinguistic tags but never shows image
        // directives.
        let display = ServerMessage::AssistantDelta {
            delta: tags::strip_image_tags(&delta),
        };
        if let TurnStatus::Cancelled = emit(sink, cancel, display).await? {
            return Ok(TurnStatus::Cancelled);
        }

        let (phrases, rest) = segment::segment(&buf);
        buf = rest;
        for phrase in phrases {
            if speak_phrase(state, conn, sink, &phrase, cancel).await? == TurnStatus::Cancelled {
                return Ok(TurnStatus::Cancelled);
            }
        }
    }

    // Step 4: whatever is left after the stream closes is the final phrase.
    if speak_phrase(state, conn, sink, &buf, cancel).await? == TurnStatus::Cancelled {
        return Ok(TurnStatus::Cancelled);
    }

    // The assistant's reply joins the history before the directive pass, so
    // the next turn sees it even if image generation fails.
    conn.lock().await.messages.push(ChatMessage::assistant(full.clone()));
    if let TurnStatus::Cancelled = emit(sink, cancel, ServerMessage::AssistantEnd).await? {
        return Ok(TurnStatus::Cancelled);
    }

    // Step 5: image directives, strictly after the full text is known — a
    // tag can be split across two deltas, so partial text is never scanned.
    let directives = tags::scan(&full);
    if !directives.is_empty() {
        let (include_imagegen, character) = {
            let conn = conn.lock().await;
            let character = (!conn.character_description.is_empty())
                .then(|| conn.character_description.clone());
            (conn.include_imagegen, character)
        };

        if include_imagegen && let Some(image_generator) = &state.engines.image_generator {
            for directive in directives {
                let Some(prompt) =
                    optimize_prompt(generator.as_ref(), &model, &directive.raw_prompt, cancel)
                        .await?
                else {
                    return Ok(TurnStatus::Cancelled);
                };
                info!(raw = %directive.raw_prompt, optimized = %prompt, "image prompt optimized");

                let announce = ServerMessage::ImageGenerating {
                    prompt: prompt.clone(),
                };
                if let TurnStatus::Cancelled = emit(sink, cancel, announce).await? {
                    return Ok(TurnStatus::Cancelled);
                }

                let Some(generated) = until_cancelled(
                    cancel,
                    image_generator.generate(&prompt, character.as_deref()),
                )
                .await
                else {
                    return Ok(TurnStatus::Cancelled);
                };
                match generated {
                    Ok(bytes) => {
                        if let Err(e) = save_image(&state.config.user_images_dir, &bytes).await {
                            warn!(error = ?e, "failed to save generated image");
                        }
                        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                        let event = ServerMessage::ImageGenerated {
                            image: encoded,
                            prompt: prompt.clone(),
                            format: "png".to_string(),
                        };
                        if let TurnStatus::Cancelled = emit(sink, cancel, event).await? {
                            return Ok(TurnStatus::Cancelled);
                        }
                        if state.config.low_vram_mode {
                            image_generator.release().await;
                        }
                    }
                    Err(e) => {
                        error!(error = ?e, "image generation failed");
                        let event = ServerMessage::ImageError {
                            error: e.to_string(),
                            prompt,
                        };
                        if let TurnStatus::Cancelled = emit(sink, cancel, event).await? {
                            return Ok(TurnStatus::Cancelled);
                        }
                    }
                }
            }
        }
    }

    Ok(TurnStatus::Completed)
}

/// Synthesizes and emits one phrase, in order: no later phrase may start
/// until this one's audio has been fully sent.
async fn speak_phrase(
    state: &AppState,
    conn: &Mutex<ConnState>,
    sink: &dyn EventSink,
    phrase: &str,
    cancel: &CancellationToken,
) -> Result<TurnStatus> {
    if cancel.is_cancelled() {
        return Ok(TurnStatus::Cancelled);
    }

    // Synthesis must never see bracketed tags of any kind.
    let stripped = tags::strip_tags(phrase);
    let clean = stripped.trim();
    if clean.is_empty() {
        return Ok(TurnStatus::Completed);
    }

    let voice_mode = { conn.lock().await.output_mode == OutputMode::Voice };
    if !voice_mode {
        return Ok(TurnStatus::Completed);
    }

    let tts = state.engines.active_tts();
    conn.lock().await.speaking = true;

    let Some(audio) = until_cancelled(cancel, tts.synthesize(clean)).await else {
        conn.lock().await.speaking = false;
        return Ok(TurnStatus::Cancelled);
    };
    let audio = match audio.with_context(|| format!("speech synthesis failed for phrase: {clean}"))
    {
        Ok(audio) => audio,
        Err(e) => {
            conn.lock().await.speaking = false;
            return Err(e);
        }
    };

    let status = emit_audio(sink, cancel, audio).await;
    conn.lock().await.speaking = false;
    status
}

/// Emits one phrase's `audio_start` / PCM / `audio_end` sequence, racing
/// every send against cancellation.
async fn emit_audio(
    sink: &dyn EventSink,
    cancel: &CancellationToken,
    audio: TtsAudio,
) -> Result<TurnStatus> {
    let start = ServerMessage::AudioStart {
        sample_rate: audio.sample_rate,
        format: "pcm16le".to_string(),
    };
    if let TurnStatus::Cancelled = emit(sink, cancel, start).await? {
        return Ok(TurnStatus::Cancelled);
    }
    let Some(sent) = until_cancelled(cancel, sink.send_pcm(audio.pcm16le)).await else {
        return Ok(TurnStatus::Cancelled);
    };
    sent?;
    emit(sink, cancel, ServerMessage::AudioEnd).await
}

/// Decodes and persists an attached image, then asks the describer for a
/// textual description to fold into the user message.
async fn describe_attachment(
    state: &AppState,
    describer: &dyn ImageDescriber,
    image_b64: &str,
    prompt: &str,
) -> Result<String> {
    // Strip a data-URL prefix ("data:image/png;base64,...") if present.
    let data = image_b64
        .split_once(',')
        .map(|(_, rest)| rest)
        .unwrap_or(image_b64);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("attached image is not valid base64")?;

    let dir = &state.config.user_images_dir;
    tokio::fs::create_dir_all(dir).await?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("upload_{timestamp}.png"));
    tokio::fs::write(&path, &bytes).await?;
    info!(path = %path.display(), "saved attached image");

    describer.describe(&path, Some(prompt)).await
}

/// Compresses a raw directive prompt into a terse keyword prompt via a short
/// auxiliary generation. Falls back to the raw prompt when the model returns
/// nothing. `None` means the turn was cancelled mid-call.
async fn optimize_prompt(
    generator: &dyn TextGenerator,
    model: &str,
    raw_prompt: &str,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let messages = vec![
        ChatMessage::system(prompts::PROMPT_OPTIMIZER_SYSTEM),
        ChatMessage::user(format!(
            "Optimize this image description into a concise prompt:\n{raw_prompt}"
        )),
    ];

    let Some(stream) = until_cancelled(cancel, generator.stream_chat(&messages, model)).await
    else {
        return Ok(None);
    };
    let mut stream = stream.context("prompt optimization call failed")?;

    use futures_util::StreamExt;
    let mut optimized = String::new();
    loop {
        let Some(next) = until_cancelled(cancel, stream.next()).await else {
            return Ok(None);
        };
        match next {
            None => break,
            Some(Ok(delta)) => optimized.push_str(&delta),
            Some(Err(e)) => return Err(e.context("prompt optimization stream failed")),
        }
    }

    let optimized = optimized.trim();
    if optimized.is_empty() {
        return Ok(Some(raw_prompt.to_string()));
    }
    let words: Vec<&str> = optimized.split_whitespace().collect();
    if words.len() > MAX_IMAGE_PROMPT_WORDS {
        return Ok(Some(words[..MAX_IMAGE_PROMPT_WORDS].join(" ")));
    }
    Ok(Some(optimized.to_string()))
}

async fn save_image(dir: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S%3f");
    let path = dir.join(format!("image_{timestamp}.png"));
    tokio::fs::write(&path, bytes).await?;
    info!(path = %path.display(), "saved generated image");
    Ok(())
}

/// Shared fakes for pipeline and session-state tests.
#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::config::Config;
    use crate::state::Engines;
    use crate::ws::protocol::ServerMessage;
    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use vocalis_core::engines::{
        ImageGenerator, SpeechSynthesizer, SpeechToText, TextGenerator, TextStream, TtsAudio,
    };

    pub fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:8000".parse().unwrap(),
            llm_host: "http://localhost:11434".into(),
            llm_model: "llama3.2".into(),
            vision_model: None,
            stt_url: "http://localhost:9000/v1/audio/transcriptions".into(),
            stt_api_key: None,
            stt_model: "whisper-1".into(),
            tts_url: "http://localhost:8880/v1/audio/speech".into(),
            tts_api_key: None,
            tts_model: "tts-1".into(),
            tts_engine: "piper".into(),
            tts_voices: vec!["alloy".into()],
            tts_sample_rate: 24000,
            imagegen_url: None,
            imagegen_api_key: None,
            imagegen_model: "dall-e-3".into(),
            imagegen_size: "1024x1024".into(),
            low_vram_mode: false,
            user_images_dir: std::env::temp_dir().join("vocalis-test-images"),
            log_level: tracing::Level::INFO,
        }
    }

    /// Replays scripted delta sequences; each `stream_chat` call consumes the
    /// next script in order (turn stream first, then optimizer calls).
    pub struct ScriptedGenerator {
        scripts: StdMutex<VecDeque<Vec<String>>>,
    }

    impl ScriptedGenerator {
        pub fn new(scripts: Vec<Vec<&str>>) -> Self {
            Self {
                scripts: StdMutex::new(
                    scripts
                        .into_iter()
                        .map(|s| s.into_iter().map(String::from).collect())
                        .collect(),
                ),
            }
        }

        pub fn empty() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn stream_chat(&self, _: &[ChatMessage], _: &str) -> Result<TextStream> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(
                script.into_iter().map(Ok),
            )))
        }
    }

    /// A generator whose stream yields one error.
    pub struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn stream_chat(&self, _: &[ChatMessage], _: &str) -> Result<TextStream> {
            Ok(Box::pin(futures::stream::iter(vec![Err(anyhow::anyhow!(
                "model exploded"
            ))])))
        }
    }

    /// Echoes the phrase text back as the "audio" payload so tests can tell
    /// which phrase each audio event belongs to.
    pub struct EchoTts;

    #[async_trait]
    impl SpeechSynthesizer for EchoTts {
        async fn synthesize(&self, text: &str) -> Result<TtsAudio> {
            Ok(TtsAudio {
                pcm16le: Bytes::from(text.as_bytes().to_vec()),
                sample_rate: 24000,
            })
        }

        fn list_voices(&self) -> Vec<String> {
            vec!["alloy".into()]
        }

        async fn load_voice(&self, voice: &str) -> Result<bool> {
            Ok(voice == "alloy")
        }

        fn current_voice(&self) -> Option<String> {
            Some("alloy".into())
        }
    }

    pub struct StubStt {
        pub transcript: String,
    }

    #[async_trait]
    impl SpeechToText for StubStt {
        async fn transcribe(&self, _: &[u8], _: u32) -> Result<String> {
            Ok(self.transcript.clone())
        }
    }

    pub struct StubImageGen {
        pub fail: bool,
    }

    #[async_trait]
    impl ImageGenerator for StubImageGen {
        async fn generate(&self, _: &str, _: Option<&str>) -> Result<Vec<u8>> {
            if self.fail {
                anyhow::bail!("diffusion backend offline");
            }
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
    }

    /// Captures the full outbound event sequence.
    #[derive(Debug)]
    pub enum Captured {
        Msg(ServerMessage),
        Pcm(Bytes),
    }

    #[derive(Default)]
    pub struct CaptureSink {
        pub events: StdMutex<Vec<Captured>>,
    }

    #[async_trait]
    impl EventSink for CaptureSink {
        async fn send(&self, msg: ServerMessage) -> Result<()> {
            self.events.lock().unwrap().push(Captured::Msg(msg));
            Ok(())
        }

        async fn send_pcm(&self, pcm: Bytes) -> Result<()> {
            self.events.lock().unwrap().push(Captured::Pcm(pcm));
            Ok(())
        }
    }

    /// A sink whose sends never resolve, like a client that stopped reading
    /// while TCP backpressure filled the socket buffer.
    pub struct StalledSink;

    #[async_trait]
    impl EventSink for StalledSink {
        async fn send(&self, _msg: ServerMessage) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn send_pcm(&self, _pcm: Bytes) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Succeeds for the first `healthy` sends, then fails like a closed
    /// socket. Records every attempted event type either way.
    pub struct DisconnectingSink {
        healthy: usize,
        pub attempts: StdMutex<Vec<String>>,
    }

    impl DisconnectingSink {
        pub fn new(healthy: usize) -> Self {
            Self {
                healthy,
                attempts: StdMutex::new(Vec::new()),
            }
        }

        fn record(&self, label: String) -> Result<()> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(label);
            if attempts.len() > self.healthy {
                return Err(crate::ws::sink::TransportClosed("connection reset".into()).into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EventSink for DisconnectingSink {
        async fn send(&self, msg: ServerMessage) -> Result<()> {
            let label = serde_json::to_value(&msg).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string();
            self.record(label)
        }

        async fn send_pcm(&self, _pcm: Bytes) -> Result<()> {
            self.record("pcm".to_string())
        }
    }

    /// Assembles an `Engines` around the fakes.
    pub fn test_engines(
        generator: Arc<dyn TextGenerator>,
        image_generator: Option<Arc<dyn ImageGenerator>>,
    ) -> Engines {
        let tts: Arc<dyn SpeechSynthesizer> = Arc::new(EchoTts);
        let mut registry: HashMap<String, Arc<dyn SpeechSynthesizer>> = HashMap::new();
        registry.insert("piper".to_string(), tts);
        Engines::new(
            Arc::new(StubStt {
                transcript: String::new(),
            }),
            generator,
            None,
            image_generator,
            registry,
            "piper",
        )
        .expect("default engine is registered")
    }
}
