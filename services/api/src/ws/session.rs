//! The WebSocket session handler: accepts the connection, pushes the initial
//! configuration, then loops over inbound frames dispatching control messages
//! and microphone audio until the client disconnects.

use crate::prompts;
use crate::state::AppState;
use crate::ws::cancel::CancellationController;
use crate::ws::conn::{ConnState, INPUT_SAMPLE_RATE, MIN_AUDIO_BYTES};
use crate::ws::pipeline::{self, TurnInput};
use crate::ws::protocol::{ClientMessage, OutputMode, ServerMessage};
use crate::ws::sink::{EventSink, WsEventSink};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};
use vocalis_core::engines::ollama::OllamaClient;

/// Pulls a character profile out of a system prompt authored as markdown with
/// a `### Character Description` section.
static CHARACTER_DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)### Character Description\s*\n(.+?)(?:\n###|$)").expect("valid regex")
});

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let session_id: u32 = rand::random();
        let span = tracing::info_span!("ws_session", id = session_id);
        handle_socket(socket, state).instrument(span).await;
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("client connected");

    let (tx, mut rx) = socket.split();
    let sink: Arc<dyn EventSink> = Arc::new(WsEventSink::new(Arc::new(Mutex::new(tx))));
    let conn = Arc::new(Mutex::new(ConnState::new(
        &state.config,
        state.engines.generator.clone(),
    )));

    let mut session = Session {
        state,
        conn,
        sink,
        controller: CancellationController::new(),
    };

    if let Err(e) = session.send_greeting().await {
        warn!(error = ?e, "failed to send greeting; closing");
        return;
    }

    while let Some(frame) = rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                info!(error = ?e, "socket error; closing session");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if let Err(e) = session.handle_text_frame(text.as_str()).await {
                    warn!(error = ?e, "failed to handle client message");
                    let _ = session
                        .sink
                        .send(ServerMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            Message::Binary(pcm) => {
                let mut conn = session.conn.lock().await;
                if conn.recording {
                    conn.user_audio.extend_from_slice(&pcm);
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Stop any in-flight generation before the session's state drops.
    session.controller.cancel_current().await;
    info!("client disconnected");
}

struct Session {
    state: Arc<AppState>,
    conn: Arc<Mutex<ConnState>>,
    sink: Arc<dyn EventSink>,
    controller: CancellationController,
}

impl Session {
    /// Pushes the session's effective configuration right after accept, so
    /// the client UI reflects server-side defaults.
    async fn send_greeting(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        self.sink
            .send(ServerMessage::Config {
                tts_engine: conn.tts_engine_type.clone(),
                llm_model: conn.llm_model.clone(),
                output_mode: conn.output_mode,
            })
            .await
    }

    async fn handle_text_frame(&mut self, raw: &str) -> Result<()> {
        let msg: ClientMessage =
            serde_json::from_str(raw).context("unrecognized client message")?;
        self.dispatch(msg).await
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::SetSystemPrompt { content } => self.set_system_prompt(content).await,
            ClientMessage::ClearChat => {
                self.conn.lock().await.clear_history();
                self.sink.send(ServerMessage::ChatCleared).await
            }
            ClientMessage::SyncHistory { history } => {
                let count = history.len();
                self.conn.lock().await.sync_history(history);
                info!(count, "history synced from client");
                self.sink
                    .send(ServerMessage::ack("history_synced", true))
                    .await
            }
            ClientMessage::SetContextMode { enabled } => {
                self.conn.lock().await.use_context = enabled;
                self.sink
                    .send(ServerMessage::ack("use_context", enabled))
                    .await
            }
            ClientMessage::SetImagegenMode { enabled } => {
                self.conn.lock().await.include_imagegen = enabled;
                self.sink
                    .send(ServerMessage::ack("imagegen_mode", enabled))
                    .await
            }
            ClientMessage::SetCharacterImage {
                character_type,
                image_path,
            } => self.set_character_image(character_type, image_path).await,
            ClientMessage::SetLlmModel { model } => {
                self.conn.lock().await.llm_model = model.clone();
                self.sink.send(ServerMessage::ack("llm_model", model)).await
            }
            ClientMessage::SetLlmHost { host } => {
                let mut conn = self.conn.lock().await;
                conn.llm_host = host.clone();
                // Point this session's generator at the new host; other
                // sessions keep the default.
                conn.generator = Arc::new(OllamaClient::new(&host));
                drop(conn);
                self.sink.send(ServerMessage::ack("llm_host", host)).await
            }
            ClientMessage::SetOutputMode { mode } => {
                self.conn.lock().await.output_mode = mode;
                let label = match mode {
                    OutputMode::Voice => "voice",
                    OutputMode::Text => "text",
                };
                self.sink.send(ServerMessage::ack("output_mode", label)).await
            }
            ClientMessage::SetTtsEngine { engine } => self.set_tts_engine(engine).await,
            ClientMessage::SetVoice { voice } => self.set_voice(voice).await,
            ClientMessage::GetAvailableVoices => {
                let tts = self.state.engines.active_tts();
                self.sink
                    .send(ServerMessage::AvailableVoices {
                        voices: tts.list_voices(),
                        current: tts.current_voice(),
                    })
                    .await
            }
            ClientMessage::Interrupt => {
                self.cancel_active_run().await;
                self.sink.send(ServerMessage::Interrupted).await
            }
            ClientMessage::StopAudio => {
                self.cancel_active_run().await;
                self.sink.send(ServerMessage::AudioStopped).await
            }
            ClientMessage::UserAudioStart => {
                // Barge-in: the user speaking supersedes whatever the
                // assistant was saying.
                self.cancel_active_run().await;
                let mut conn = self.conn.lock().await;
                conn.recording = true;
                conn.user_audio.clear();
                drop(conn);
                self.sink
                    .send(ServerMessage::AckRecording { recording: true })
                    .await
            }
            ClientMessage::UserAudioEnd => self.finish_recording().await,
            ClientMessage::TextMessage { text, image } => {
                if text.trim().is_empty() && image.is_none() {
                    return Ok(());
                }
                self.start_turn(TurnInput {
                    text,
                    image_base64: image,
                })
                .await;
                Ok(())
            }
        }
    }

    async fn set_system_prompt(&mut self, content: String) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.character_description = CHARACTER_DESCRIPTION
            .captures(&content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        if !conn.character_description.is_empty() {
            info!("extracted character description from system prompt");
        }

        let effective = if conn.include_imagegen && self.state.engines.image_generator.is_some() {
            format!("{content}\n\n{}", prompts::IMAGEGEN_INSTRUCTIONS)
        } else {
            content
        };
        conn.replace_system(effective);
        drop(conn);
        self.sink
            .send(ServerMessage::ack("system_prompt_set", true))
            .await
    }

    async fn set_character_image(
        &mut self,
        character_type: String,
        image_path: String,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        match character_type.as_str() {
            "user" => conn.user_character_image = image_path,
            "assistant" => conn.assistant_character_image = image_path,
            other => {
                drop(conn);
                return self
                    .sink
                    .send(ServerMessage::Error {
                        message: format!("unknown character type: {other}"),
                    })
                    .await;
            }
        }
        drop(conn);
        self.sink
            .send(ServerMessage::ack("character_image", character_type))
            .await
    }

    async fn set_tts_engine(&mut self, engine: String) -> Result<()> {
        match self.state.engines.switch_tts(&engine) {
            Some(_) => {
                self.conn.lock().await.tts_engine_type = engine.clone();
                info!(engine, "switched TTS engine");
                self.sink
                    .send(ServerMessage::TtsEngineChanged { tts_engine: engine })
                    .await
            }
            None => {
                self.sink
                    .send(ServerMessage::Error {
                        message: format!(
                            "unknown TTS engine: {engine} (available: {})",
                            self.state.engines.tts_engine_names().join(", ")
                        ),
                    })
                    .await
            }
        }
    }

    async fn set_voice(&mut self, voice: String) -> Result<()> {
        let tts = self.state.engines.active_tts();
        if tts.load_voice(&voice).await? {
            self.sink.send(ServerMessage::ack("voice", voice)).await
        } else {
            self.sink
                .send(ServerMessage::Error {
                    message: format!("unknown voice: {voice}"),
                })
                .await
        }
    }

    /// Ends recording and, if enough audio arrived, transcribes it and starts
    /// a turn. Too-short recordings are treated as accidental taps.
    async fn finish_recording(&mut self) -> Result<()> {
        let audio = {
            let mut conn = self.conn.lock().await;
            conn.recording = false;
            std::mem::take(&mut conn.user_audio)
        };
        self.sink
            .send(ServerMessage::AckRecording { recording: false })
            .await?;

        if audio.len() < MIN_AUDIO_BYTES {
            info!(bytes = audio.len(), "recording too short for transcription");
            return self
                .sink
                .send(ServerMessage::Transcript {
                    text: String::new(),
                })
                .await;
        }

        let transcript = self
            .state
            .engines
            .stt
            .transcribe(&audio, INPUT_SAMPLE_RATE)
            .await
            .context("transcription failed")?;
        let transcript = transcript.trim().to_string();

        // The transcript event always goes out, even when empty, so the
        // client can settle its recording UI; only non-empty text starts a
        // turn.
        self.sink
            .send(ServerMessage::Transcript {
                text: transcript.clone(),
            })
            .await?;
        if transcript.is_empty() {
            info!("empty transcript; no turn started");
            return Ok(());
        }
        self.start_turn(TurnInput {
            text: transcript,
            image_base64: None,
        })
        .await;
        Ok(())
    }

    /// Cancels the active run and awaits its exit, then clears the speaking
    /// flag in case the run was stopped mid-phrase.
    async fn cancel_active_run(&mut self) {
        self.controller.cancel_current().await;
        self.conn.lock().await.speaking = false;
    }

    /// Supersedes the active run with a new one. The old run is fully stopped
    /// before the new task spawns, so turns never interleave.
    async fn start_turn(&mut self, turn: TurnInput) {
        self.cancel_active_run().await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(pipeline::run_turn(
            self.state.clone(),
            self.conn.clone(),
            self.sink.clone(),
            turn,
            token.clone(),
        ));
        self.controller.install(token, handle);
    }
}
