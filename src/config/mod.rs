//! Configuration management for the voice relay

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use file::RelayConfigFile;

/// Default port for the HTTP/WebSocket server
pub const DEFAULT_PORT: u16 = 8000;

/// Default assistant instruction
const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. \
Replies are spoken aloud, so keep them short, clear and natural to say. \
Answer directly without filler. Use short numbered steps only when the user \
asks for instructions. Never use markdown, lists of symbols or code blocks.";

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Speech recognition configuration
    pub recognition: RecognitionConfig,

    /// Turn detection configuration
    pub turns: TurnConfig,

    /// LLM configuration
    pub llm: LlmConfig,

    /// Speech synthesis configuration
    pub synthesis: SynthesisConfig,

    /// Pipeline tuning
    pub pipeline: PipelineConfig,
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Path to static files directory (web client)
    pub static_dir: Option<PathBuf>,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `AssemblyAI` key (streaming recognition)
    pub assemblyai: Option<SecretString>,

    /// Gemini key (text generation)
    pub gemini: Option<SecretString>,

    /// Murf key (speech synthesis)
    pub murf: Option<SecretString>,

    /// `SerpAPI` key (web search grounding, optional)
    pub serpapi: Option<SecretString>,
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Sample rate of the PCM frames clients send
    pub sample_rate: u32,

    /// Request formatted (punctuated, cased) turns
    pub format_turns: bool,
}

/// What to do with a turn that completes while a run is still active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Drop the new turn with a warning
    #[default]
    Drop,
    /// Start it once the active run finishes
    Queue,
}

impl FromStr for BusyPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "queue" => Ok(Self::Queue),
            other => Err(Error::Config(format!("unknown busy policy: {other}"))),
        }
    }
}

/// Turn detection configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Turns with this many characters or fewer are treated as noise
    pub min_turn_chars: usize,

    /// Minimum time between two accepted turns
    pub min_turn_spacing: Duration,

    /// Number of recently accepted turns remembered for de-duplication
    pub recent_turn_capacity: usize,

    /// Handling of turns that arrive while a run is active
    pub busy_policy: BusyPolicy,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            min_turn_chars: 3,
            min_turn_spacing: Duration::from_secs(2),
            recent_turn_capacity: 32,
            busy_policy: BusyPolicy::Drop,
        }
    }
}

/// LLM configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Gemini model identifier
    pub model: String,

    /// System instruction
    pub system_prompt: String,
}

/// Speech synthesis strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// One request per sentence
    #[default]
    OneShot,
    /// One streaming session per run, fed sentence by sentence
    Streaming,
}

impl FromStr for SynthesisStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "one_shot" | "oneshot" => Ok(Self::OneShot),
            "streaming" | "stream" => Ok(Self::Streaming),
            other => Err(Error::Config(format!("unknown synthesis strategy: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// One-shot or streaming session
    pub strategy: SynthesisStrategy,

    /// Murf voice identifier
    pub voice_id: String,

    /// Murf voice style
    pub style: String,

    /// Audio container format ("WAV", "MP3")
    pub format: String,

    /// Output sample rate
    pub sample_rate: u32,
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the sentence queue between generation and synthesis
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 4 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: DEFAULT_PORT,
                static_dir: None,
            },
            api_keys: ApiKeys::default(),
            recognition: RecognitionConfig {
                sample_rate: 16_000,
                format_turns: true,
            },
            turns: TurnConfig::default(),
            llm: LlmConfig {
                model: "gemini-1.5-flash".to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            },
            synthesis: SynthesisConfig {
                strategy: SynthesisStrategy::OneShot,
                voice_id: "en-US-ken".to_string(),
                style: "Conversational".to_string(),
                format: "WAV".to_string(),
                sample_rate: 44_100,
            },
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the TOML file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Precedence is env > toml > default.
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or fails validation
    pub fn from_sources<F>(fc: RelayConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secret = |key: &str, file_value: Option<String>| {
            env(key)
                .or(file_value)
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from)
        };

        let api_keys = ApiKeys {
            assemblyai: secret("ASSEMBLYAI_API_KEY", fc.api_keys.assemblyai),
            gemini: secret("GEMINI_API_KEY", fc.api_keys.gemini),
            murf: secret("MURF_API_KEY", fc.api_keys.murf),
            serpapi: secret("SERPAPI_API_KEY", fc.api_keys.serpapi),
        };

        let server = ServerConfig {
            port: parse_env(&env, "VOICE_RELAY_PORT")?
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
            static_dir: env("VOICE_RELAY_STATIC_DIR")
                .map(PathBuf::from)
                .or(fc.server.static_dir),
        };

        let recognition = RecognitionConfig {
            sample_rate: parse_env(&env, "VOICE_RELAY_SAMPLE_RATE")?
                .or(fc.recognition.sample_rate)
                .unwrap_or(defaults.recognition.sample_rate),
            format_turns: fc
                .recognition
                .format_turns
                .unwrap_or(defaults.recognition.format_turns),
        };

        let busy_policy = match env("VOICE_RELAY_BUSY_POLICY").or(fc.turns.busy_policy) {
            Some(s) => s.parse()?,
            None => defaults.turns.busy_policy,
        };
        let turns = TurnConfig {
            min_turn_chars: fc
                .turns
                .min_turn_chars
                .unwrap_or(defaults.turns.min_turn_chars),
            min_turn_spacing: parse_env(&env, "VOICE_RELAY_MIN_TURN_SPACING_MS")?
                .or(fc.turns.min_turn_spacing_ms)
                .map_or(defaults.turns.min_turn_spacing, Duration::from_millis),
            recent_turn_capacity: fc
                .turns
                .recent_turn_capacity
                .unwrap_or(defaults.turns.recent_turn_capacity),
            busy_policy,
        };

        let llm = LlmConfig {
            model: env("VOICE_RELAY_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(defaults.llm.model),
            system_prompt: fc.llm.system_prompt.unwrap_or(defaults.llm.system_prompt),
        };

        let strategy = match env("VOICE_RELAY_SYNTHESIS_STRATEGY").or(fc.synthesis.strategy) {
            Some(s) => s.parse()?,
            None => defaults.synthesis.strategy,
        };
        let synthesis = SynthesisConfig {
            strategy,
            voice_id: env("VOICE_RELAY_VOICE_ID")
                .or(fc.synthesis.voice_id)
                .unwrap_or(defaults.synthesis.voice_id),
            style: fc.synthesis.style.unwrap_or(defaults.synthesis.style),
            format: fc.synthesis.format.unwrap_or(defaults.synthesis.format),
            sample_rate: fc
                .synthesis
                .sample_rate
                .unwrap_or(defaults.synthesis.sample_rate),
        };

        let pipeline = PipelineConfig {
            queue_capacity: parse_env(&env, "VOICE_RELAY_QUEUE_CAPACITY")?
                .or(fc.pipeline.queue_capacity)
                .unwrap_or(defaults.pipeline.queue_capacity),
        };

        let config = Self {
            server,
            api_keys,
            recognition,
            turns,
            llm,
            synthesis,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.recognition.sample_rate == 0 || self.synthesis.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".to_string()));
        }
        if self.turns.recent_turn_capacity == 0 {
            return Err(Error::Config(
                "recent_turn_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an optional environment value
fn parse_env<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(RelayConfigFile::default(), env_from(&[])).unwrap();

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.recognition.sample_rate, 16_000);
        assert_eq!(config.turns.min_turn_spacing, Duration::from_secs(2));
        assert_eq!(config.pipeline.queue_capacity, 4);
        assert_eq!(config.synthesis.strategy, SynthesisStrategy::OneShot);
        assert!(config.api_keys.gemini.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let fc: RelayConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000
            [api_keys]
            gemini = "from-file"
            [synthesis]
            strategy = "streaming"
            "#,
        )
        .unwrap();

        let env = env_from(&[
            ("VOICE_RELAY_PORT", "9100"),
            ("GEMINI_API_KEY", "from-env"),
        ]);
        let config = Config::from_sources(fc, env).unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.api_keys.gemini.as_ref().unwrap().expose_secret(),
            "from-env"
        );
        assert_eq!(config.synthesis.strategy, SynthesisStrategy::Streaming);
    }

    #[test]
    fn blank_keys_are_ignored() {
        let env = env_from(&[("MURF_API_KEY", "  ")]);
        let config = Config::from_sources(RelayConfigFile::default(), env).unwrap();
        assert!(config.api_keys.murf.is_none());
    }

    #[test]
    fn invalid_env_number_is_an_error() {
        let env = env_from(&[("VOICE_RELAY_QUEUE_CAPACITY", "lots")]);
        let err = Config::from_sources(RelayConfigFile::default(), env).unwrap_err();
        assert!(err.to_string().contains("VOICE_RELAY_QUEUE_CAPACITY"));
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let env = env_from(&[("VOICE_RELAY_QUEUE_CAPACITY", "0")]);
        assert!(Config::from_sources(RelayConfigFile::default(), env).is_err());
    }

    #[test]
    fn busy_policy_parses() {
        assert_eq!("queue".parse::<BusyPolicy>().unwrap(), BusyPolicy::Queue);
        assert_eq!(" Drop ".parse::<BusyPolicy>().unwrap(), BusyPolicy::Drop);
        assert!("later".parse::<BusyPolicy>().is_err());
    }

    #[test]
    fn strategy_parses() {
        assert_eq!(
            "one-shot".parse::<SynthesisStrategy>().unwrap(),
            SynthesisStrategy::OneShot
        );
        assert_eq!(
            "streaming".parse::<SynthesisStrategy>().unwrap(),
            SynthesisStrategy::Streaming
        );
    }
}
