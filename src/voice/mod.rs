//! Voice conversation pipeline
//!
//! Transcripts from a recognition session are collapsed into turns; each
//! accepted turn drives one run that streams a reply, splits it into
//! sentences and synthesizes them in order. Time-sensitive prompts may be
//! grounded in web search results first.

pub mod generation;
pub mod pipeline;
pub mod recognition;
pub mod search;
pub mod segment;
pub mod synthesis;
pub mod turn;

pub use generation::{FragmentStream, GenerationOutcome, GenerationStream, TextGenerator, generate};
pub use pipeline::{PipelineCoordinator, PipelineEvent, RunOutcome, RunState};
pub use recognition::{RecognitionEvent, RecognitionSession, SpeechRecognizer};
pub use search::{SearchGrounded, WebSearch, needs_search};
pub use segment::{SentenceSegmenter, SentenceUnit, segment};
pub use synthesis::{
    AudioChunkStream, AudioUnit, SessionSink, SpeechSynthesizer, StreamingSynthesizer, Synthesis,
    SynthesisSession, Voice,
};
pub use turn::{TranscriptEvent, TurnAggregator, Utterance, normalize};
