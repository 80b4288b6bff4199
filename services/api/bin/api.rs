//! Main Entrypoint for the Vocalis API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the speech, text-generation, and image engines.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{collections::HashMap, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use vocalis_api::{
    config::Config,
    router::create_router,
    state::{AppState, Engines},
};
use vocalis_core::engines::{
    ImageDescriber, ImageGenerator, SpeechSynthesizer, SpeechToText, TextGenerator,
    imagegen::HttpImageGenerator,
    ollama::{OllamaClient, OllamaVision},
    speech::{HttpSpeechSynthesizer, HttpSpeechToText},
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing engines...");

    // --- 3. Initialize Engines ---
    let stt: Arc<dyn SpeechToText> = Arc::new(HttpSpeechToText::new(
        config.stt_url.clone(),
        config.stt_api_key.clone(),
        config.stt_model.clone(),
    ));

    let generator: Arc<dyn TextGenerator> = Arc::new(OllamaClient::new(config.llm_host.clone()));

    let describer: Option<Arc<dyn ImageDescriber>> = config.vision_model.as_ref().map(|model| {
        info!(model, "vision model enabled");
        Arc::new(OllamaVision::new(config.llm_host.clone(), model.clone()))
            as Arc<dyn ImageDescriber>
    });

    let image_generator: Option<Arc<dyn ImageGenerator>> = config.imagegen_url.as_ref().map(|url| {
        info!(url, model = %config.imagegen_model, "image generation enabled");
        Arc::new(HttpImageGenerator::new(
            url.clone(),
            config.imagegen_api_key.clone(),
            config.imagegen_model.clone(),
            config.imagegen_size.clone(),
        )) as Arc<dyn ImageGenerator>
    });

    let tts: Arc<dyn SpeechSynthesizer> = Arc::new(HttpSpeechSynthesizer::new(
        config.tts_url.clone(),
        config.tts_api_key.clone(),
        config.tts_model.clone(),
        config.tts_sample_rate,
        config.tts_voices.clone(),
        config.default_voice(),
    ));
    let mut tts_registry: HashMap<String, Arc<dyn SpeechSynthesizer>> = HashMap::new();
    tts_registry.insert(config.tts_engine.clone(), tts);

    let engines = Engines::new(
        stt,
        generator,
        describer,
        image_generator,
        tts_registry,
        &config.tts_engine,
    )?;

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        engines: Arc::new(engines),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        model = %config.llm_model,
        tts_engine = %config.tts_engine,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
