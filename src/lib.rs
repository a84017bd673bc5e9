//! Voice Relay - real-time voice conversations over a single WebSocket
//!
//! A client streams microphone audio in; the relay transcribes it, detects
//! completed turns, streams a reply from a language model and sends the
//! reply back as text and synthesized audio, sentence by sentence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Client (browser)                     │
//! │        PCM frames ▲              │ JSON events        │
//! └────────────────────┼─────────────▼────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Connection handler                    │
//! │  Recognition → Turn aggregator → Pipeline run        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Pipeline run                        │
//! │  Generation → Sentences → bounded queue → Synthesis  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod providers;
pub mod voice;

pub use config::Config;
pub use conversation::{ConversationState, Exchange, Role};
pub use error::{Error, Result};
pub use providers::Providers;
