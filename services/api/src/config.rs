use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub llm_host: String,
    pub llm_model: String,
    /// Vision model for describing user-attached images. Unset disables the
    /// describer; turns with images fall back to a text note.
    pub vision_model: Option<String>,
    pub stt_url: String,
    pub stt_api_key: Option<String>,
    pub stt_model: String,
    pub tts_url: String,
    pub tts_api_key: Option<String>,
    pub tts_model: String,
    /// Name the synthesis engine is registered under (`set_tts_engine`
    /// switches against this registry).
    pub tts_engine: String,
    pub tts_voices: Vec<String>,
    pub tts_sample_rate: u32,
    /// Image generation endpoint. Unset disables image directives entirely.
    pub imagegen_url: Option<String>,
    pub imagegen_api_key: Option<String>,
    pub imagegen_model: String,
    pub imagegen_size: String,
    /// Release generator weights after every image when set.
    pub low_vram_mode: bool,
    pub user_images_dir: PathBuf,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let llm_host =
            std::env::var("LLM_HOST").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let llm_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
        let vision_model = std::env::var("VISION_MODEL").ok();

        let stt_url =
            std::env::var("STT_URL").map_err(|_| ConfigError::MissingVar("STT_URL".to_string()))?;
        let stt_api_key = std::env::var("STT_API_KEY").ok();
        let stt_model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());

        let tts_url =
            std::env::var("TTS_URL").map_err(|_| ConfigError::MissingVar("TTS_URL".to_string()))?;
        let tts_api_key = std::env::var("TTS_API_KEY").ok();
        let tts_model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let tts_engine = std::env::var("TTS_ENGINE").unwrap_or_else(|_| "piper".to_string());

        let tts_voices: Vec<String> = std::env::var("TTS_VOICES")
            .unwrap_or_else(|_| "alloy".to_string())
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if tts_voices.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TTS_VOICES".to_string(),
                "at least one voice name is required".to_string(),
            ));
        }

        let tts_sample_rate_str =
            std::env::var("TTS_SAMPLE_RATE").unwrap_or_else(|_| "24000".to_string());
        let tts_sample_rate = tts_sample_rate_str.parse::<u32>().map_err(|e| {
            ConfigError::InvalidValue("TTS_SAMPLE_RATE".to_string(), e.to_string())
        })?;

        let imagegen_url = std::env::var("IMAGEGEN_URL").ok();
        let imagegen_api_key = std::env::var("IMAGEGEN_API_KEY").ok();
        let imagegen_model =
            std::env::var("IMAGEGEN_MODEL").unwrap_or_else(|_| "dall-e-3".to_string());
        let imagegen_size =
            std::env::var("IMAGEGEN_SIZE").unwrap_or_else(|_| "1024x1024".to_string());

        let low_vram_mode = std::env::var("LOW_VRAM_MODE")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(true);

        let user_images_dir = std::env::var("USER_IMAGES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./user_data/images"));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            llm_host,
            llm_model,
            vision_model,
            stt_url,
            stt_api_key,
            stt_model,
            tts_url,
            tts_api_key,
            tts_model,
            tts_engine,
            tts_voices,
            tts_sample_rate,
            imagegen_url,
            imagegen_api_key,
            imagegen_model,
            imagegen_size,
            low_vram_mode,
            user_images_dir,
            log_level,
        })
    }

    /// Default voice handed to the synthesizer at startup.
    pub fn default_voice(&self) -> &str {
        &self.tts_voices[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            for var in [
                "BIND_ADDRESS",
                "LLM_HOST",
                "LLM_MODEL",
                "VISION_MODEL",
                "STT_URL",
                "STT_API_KEY",
                "STT_MODEL",
                "TTS_URL",
                "TTS_API_KEY",
                "TTS_MODEL",
                "TTS_ENGINE",
                "TTS_VOICES",
                "TTS_SAMPLE_RATE",
                "IMAGEGEN_URL",
                "IMAGEGEN_API_KEY",
                "IMAGEGEN_MODEL",
                "IMAGEGEN_SIZE",
                "LOW_VRAM_MODE",
                "USER_IMAGES_DIR",
                "RUST_LOG",
            ] {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("STT_URL", "http://localhost:9000/v1/audio/transcriptions");
            env::set_var("TTS_URL", "http://localhost:8880/v1/audio/speech");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8000");
        assert_eq!(config.llm_host, "http://localhost:11434");
        assert_eq!(config.llm_model, "llama3.2");
        assert_eq!(config.vision_model, None);
        assert_eq!(config.tts_engine, "piper");
        assert_eq!(config.tts_voices, vec!["alloy".to_string()]);
        assert_eq!(config.default_voice(), "alloy");
        assert_eq!(config.tts_sample_rate, 24000);
        assert_eq!(config.imagegen_url, None);
        assert!(config.low_vram_mode);
        assert_eq!(config.user_images_dir, PathBuf::from("./user_data/images"));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("LLM_HOST", "http://llm:11434/");
            env::set_var("LLM_MODEL", "qwen2.5");
            env::set_var("VISION_MODEL", "llava");
            env::set_var("TTS_ENGINE", "kokoro");
            env::set_var("TTS_VOICES", "jenny, alan");
            env::set_var("TTS_SAMPLE_RATE", "16000");
            env::set_var("IMAGEGEN_URL", "http://sd:7860/v1/images/generations");
            env::set_var("LOW_VRAM_MODE", "false");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.llm_model, "qwen2.5");
        assert_eq!(config.vision_model, Some("llava".to_string()));
        assert_eq!(config.tts_engine, "kokoro");
        assert_eq!(
            config.tts_voices,
            vec!["jenny".to_string(), "alan".to_string()]
        );
        assert_eq!(config.default_voice(), "jenny");
        assert_eq!(config.tts_sample_rate, 16000);
        assert!(config.imagegen_url.is_some());
        assert!(!config.low_vram_mode);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_stt_url() {
        clear_env_vars();
        unsafe {
            env::set_var("TTS_URL", "http://localhost:8880/v1/audio/speech");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "STT_URL"),
            _ => panic!("Expected MissingVar for STT_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_tts_url() {
        clear_env_vars();
        unsafe {
            env::set_var("STT_URL", "http://localhost:9000/v1/audio/transcriptions");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "TTS_URL"),
            _ => panic!("Expected MissingVar for TTS_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_sample_rate() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("TTS_SAMPLE_RATE", "fast");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "TTS_SAMPLE_RATE"),
            _ => panic!("Expected InvalidValue for TTS_SAMPLE_RATE"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
