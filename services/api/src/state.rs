//! Shared Application State
//!
//! Engine instances are process-wide singletons shared by every session.
//! They are constructed once in `main` and injected here — sessions never
//! reach into globals, so tests can hand the pipeline doubles instead.

use crate::config::Config;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use vocalis_core::engines::{
    ImageDescriber, ImageGenerator, SpeechSynthesizer, SpeechToText, TextGenerator,
};

/// The engine ports every session orchestrates.
pub struct Engines {
    pub stt: Arc<dyn SpeechToText>,
    /// Default text generator; sessions clone this handle and may later swap
    /// their own copy when the client changes the LLM host.
    pub generator: Arc<dyn TextGenerator>,
    /// The describer and generator are optional deployments, mirroring their
    /// enable flags in [`Config`].
    pub describer: Option<Arc<dyn ImageDescriber>>,
    pub image_generator: Option<Arc<dyn ImageGenerator>>,
    /// Synthesis engines by registry name.
    tts_registry: HashMap<String, Arc<dyn SpeechSynthesizer>>,
    /// The active engine. Swapped as a whole `Arc` so an in-flight synthesis
    /// call keeps its own clone of the old engine alive; engine internals are
    /// never mutated under a concurrent caller.
    active_tts: RwLock<Arc<dyn SpeechSynthesizer>>,
}

impl Engines {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        generator: Arc<dyn TextGenerator>,
        describer: Option<Arc<dyn ImageDescriber>>,
        image_generator: Option<Arc<dyn ImageGenerator>>,
        tts_registry: HashMap<String, Arc<dyn SpeechSynthesizer>>,
        default_tts: &str,
    ) -> anyhow::Result<Self> {
        let active = tts_registry
            .get(default_tts)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("TTS engine '{default_tts}' is not registered"))?;
        Ok(Self {
            stt,
            generator,
            describer,
            image_generator,
            tts_registry,
            active_tts: RwLock::new(active),
        })
    }

    /// Returns a handle to the currently active synthesis engine.
    pub fn active_tts(&self) -> Arc<dyn SpeechSynthesizer> {
        self.active_tts.read().expect("tts lock poisoned").clone()
    }

    /// Atomically replaces the active synthesis engine. Returns the new
    /// handle, or `None` when the name is not registered.
    pub fn switch_tts(&self, name: &str) -> Option<Arc<dyn SpeechSynthesizer>> {
        let engine = self.tts_registry.get(name)?.clone();
        *self.active_tts.write().expect("tts lock poisoned") = engine.clone();
        Some(engine)
    }

    pub fn tts_engine_names(&self) -> Vec<String> {
        self.tts_registry.keys().cloned().collect()
    }
}

/// The shared application state, created once at startup and passed to all
/// handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub engines: Arc<Engines>,
}
