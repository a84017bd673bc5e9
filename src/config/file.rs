//! TOML configuration file loading
//!
//! Supports `~/.config/voice-relay/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct RelayConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// API keys for the collaborator services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Speech recognition configuration
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Turn detection configuration
    #[serde(default)]
    pub turns: TurnsFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis configuration
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP/WebSocket port
    pub port: Option<u16>,

    /// Directory with a static web client
    pub static_dir: Option<PathBuf>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub assemblyai: Option<String>,
    pub gemini: Option<String>,
    pub murf: Option<String>,
    pub serpapi: Option<String>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// PCM sample rate of client audio
    pub sample_rate: Option<u32>,

    /// Ask the recognizer for formatted (punctuated) turns
    pub format_turns: Option<bool>,
}

/// Turn detection configuration
#[derive(Debug, Default, Deserialize)]
pub struct TurnsFileConfig {
    pub min_turn_chars: Option<usize>,
    pub min_turn_spacing_ms: Option<u64>,
    pub recent_turn_capacity: Option<usize>,
    /// "drop" or "queue"
    pub busy_policy: Option<String>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gemini-1.5-flash")
    pub model: Option<String>,

    /// System instruction sent with every turn
    pub system_prompt: Option<String>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// "one_shot" or "streaming"
    pub strategy: Option<String>,
    pub voice_id: Option<String>,
    pub style: Option<String>,
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
}

/// Pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    /// Sentences buffered between generation and synthesis
    pub queue_capacity: Option<usize>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path is
/// tried and `RelayConfigFile::default()` is returned if it is missing or
/// unreadable.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<RelayConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(RelayConfigFile::default());
    };

    if !path.exists() {
        return Ok(RelayConfigFile::default());
    }

    let config = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                RelayConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            RelayConfigFile::default()
        }
    };

    Ok(config)
}

/// Return the config file path: `~/.config/voice-relay/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-relay").join("config.toml"))
}
