//! Speech synthesis collaborators
//!
//! Two shapes are supported. A [`SpeechSynthesizer`] turns one sentence into
//! one audio buffer. A [`StreamingSynthesizer`] opens a session per run that
//! is fed sentence by sentence and streams audio chunks back.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Audio chunks produced by a streaming session
pub type AudioChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// A unit of synthesized audio as delivered to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioUnit {
    pub bytes: Vec<u8>,
    /// Zero-based position within the run
    pub sequence: u64,
}

/// A voice offered by the synthesis backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub styles: Vec<String>,
}

/// One-shot synthesis: one request per sentence
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into a complete audio buffer
    ///
    /// # Errors
    ///
    /// Returns `SynthesisFailed` if the backend rejects the request
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Voices available to this backend
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried
    async fn voices(&self) -> Result<Vec<Voice>> {
        Ok(Vec::new())
    }

    /// MIME type of the produced audio
    fn content_type(&self) -> &'static str {
        "audio/wav"
    }

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Text side of a streaming synthesis session
#[async_trait]
pub trait SessionSink: Send {
    /// Send one sentence; `is_last` marks the end of the run's text
    ///
    /// # Errors
    ///
    /// Returns error if the session can no longer accept text
    async fn feed(&mut self, text: &str, is_last: bool) -> Result<()>;

    /// Signal end of input if no sentence carried `is_last`
    ///
    /// # Errors
    ///
    /// Returns error if the end marker cannot be sent
    async fn finish(&mut self) -> Result<()>;
}

/// An open streaming synthesis session
///
/// Dropping it releases the underlying connection.
pub struct SynthesisSession {
    pub sink: Box<dyn SessionSink>,
    pub audio: AudioChunkStream,
}

/// Session-based synthesis: one session per run
#[async_trait]
pub trait StreamingSynthesizer: Send + Sync {
    /// Open a session whose audio is tagged with `context_id`
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be established
    async fn open(&self, context_id: &str) -> Result<SynthesisSession>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Synthesis strategy selected for a pipeline
#[derive(Clone)]
pub enum Synthesis {
    OneShot(Arc<dyn SpeechSynthesizer>),
    Streaming(Arc<dyn StreamingSynthesizer>),
}

impl Synthesis {
    /// Backend name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OneShot(s) => s.name(),
            Self::Streaming(s) => s.name(),
        }
    }
}

impl std::fmt::Debug for Synthesis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneShot(s) => f.debug_tuple("OneShot").field(&s.name()).finish(),
            Self::Streaming(s) => f.debug_tuple("Streaming").field(&s.name()).finish(),
        }
    }
}
