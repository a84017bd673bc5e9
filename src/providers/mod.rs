//! Concrete recognition, generation, synthesis and search backends

pub mod assemblyai;
pub mod gemini;
pub mod murf;
pub mod serpapi;

use std::sync::Arc;

use crate::config::{ApiKeys, Config, SynthesisStrategy};
use crate::voice::generation::TextGenerator;
use crate::voice::recognition::SpeechRecognizer;
use crate::voice::search::SearchGrounded;
use crate::voice::synthesis::{SpeechSynthesizer, Synthesis};

pub use assemblyai::AssemblyAiRecognizer;
pub use gemini::GeminiGenerator;
pub use murf::{MurfSpeech, MurfStreaming};
pub use serpapi::SerpApiSearch;

/// Collaborators available to a connection
///
/// A slot is `None` when its API key is missing.
#[derive(Clone, Default)]
pub struct Providers {
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub generator: Option<Arc<dyn TextGenerator>>,
    /// Strategy used by the conversation pipeline
    pub synthesis: Option<Synthesis>,
    /// One-shot synthesizer for direct requests
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
}

impl Providers {
    /// Build backends for the given keys
    #[must_use]
    pub fn from_keys(config: &Config, keys: &ApiKeys) -> Self {
        let recognizer = keys.assemblyai.clone().map(|key| {
            Arc::new(AssemblyAiRecognizer::new(key, &config.recognition)) as Arc<dyn SpeechRecognizer>
        });

        let generator = keys.gemini.clone().map(|key| {
            let gemini = Arc::new(GeminiGenerator::new(key, &config.llm)) as Arc<dyn TextGenerator>;
            match &keys.serpapi {
                Some(search_key) => Arc::new(SearchGrounded::new(
                    gemini,
                    Arc::new(SerpApiSearch::new(search_key.clone())),
                )) as Arc<dyn TextGenerator>,
                None => gemini,
            }
        });

        let speech = keys.murf.clone().map(|key| {
            Arc::new(MurfSpeech::new(key, &config.synthesis)) as Arc<dyn SpeechSynthesizer>
        });

        let synthesis = match (config.synthesis.strategy, &keys.murf) {
            (_, None) => None,
            (SynthesisStrategy::OneShot, Some(_)) => speech.clone().map(Synthesis::OneShot),
            (SynthesisStrategy::Streaming, Some(key)) => Some(Synthesis::Streaming(Arc::new(
                MurfStreaming::new(key.clone(), &config.synthesis),
            ))),
        };

        Self {
            recognizer,
            generator,
            synthesis,
            speech,
        }
    }

    /// Build backends from the server-wide keys
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::from_keys(config, &config.api_keys)
    }

    /// Names of the services that have no backend
    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.recognizer.is_none() {
            missing.push("recognition");
        }
        if self.generator.is_none() {
            missing.push("generation");
        }
        if self.synthesis.is_none() {
            missing.push("synthesis");
        }
        missing
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("recognizer", &self.recognizer.as_ref().map(|r| r.name()))
            .field("generator", &self.generator.as_ref().map(|g| g.name()))
            .field("synthesis", &self.synthesis)
            .finish_non_exhaustive()
    }
}
