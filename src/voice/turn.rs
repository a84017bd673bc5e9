//! Turn detection over a live transcription feed
//!
//! The recognizer re-emits finalized turns (once raw, once formatted) and
//! sometimes fires turn boundaries in quick succession. The aggregator
//! collapses that feed into exactly one [`Utterance`] per completed turn.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::config::TurnConfig;

/// One transcription update from the recognition collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub end_of_turn: bool,
    pub timestamp: Instant,
}

impl TranscriptEvent {
    /// Interim (partial) transcript
    #[must_use]
    pub fn partial(text: impl Into<String>, timestamp: Instant) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            end_of_turn: false,
            timestamp,
        }
    }

    /// Transcript closing a turn
    #[must_use]
    pub fn end_of_turn(text: impl Into<String>, timestamp: Instant) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            end_of_turn: true,
            timestamp,
        }
    }
}

/// A completed, de-duplicated user turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Lowercased, whitespace-collapsed text used for de-duplication
    pub normalized_text: String,
    /// Trimmed text as the recognizer produced it
    pub raw_text: String,
    /// Timestamp of the first event of this turn
    pub turn_started_at: Instant,
}

/// Lowercase and collapse whitespace runs to single spaces
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Filters transcript events down to accepted turns
#[derive(Debug)]
pub struct TurnAggregator {
    config: TurnConfig,
    recent: HashSet<String>,
    recent_order: VecDeque<String>,
    last_accepted: Option<Instant>,
    turn_started_at: Option<Instant>,
}

impl TurnAggregator {
    #[must_use]
    pub fn new(config: TurnConfig) -> Self {
        Self {
            recent: HashSet::with_capacity(config.recent_turn_capacity),
            recent_order: VecDeque::with_capacity(config.recent_turn_capacity),
            config,
            last_accepted: None,
            turn_started_at: None,
        }
    }

    /// Feed one event; returns an utterance when it completes a new turn
    pub fn ingest(&mut self, event: &TranscriptEvent) -> Option<Utterance> {
        let text = event.text.trim();
        if text.is_empty() {
            return None;
        }

        let started_at = *self.turn_started_at.get_or_insert(event.timestamp);

        if !event.end_of_turn {
            return None;
        }
        self.turn_started_at = None;

        if text.chars().count() <= self.config.min_turn_chars {
            tracing::trace!(text, "ignoring short turn");
            return None;
        }

        let normalized = normalize(text);
        if self.recent.contains(&normalized) {
            tracing::debug!(text, "suppressing repeated turn");
            return None;
        }

        if let Some(last) = self.last_accepted {
            let elapsed = event.timestamp.saturating_duration_since(last);
            if elapsed <= self.config.min_turn_spacing {
                tracing::debug!(
                    text,
                    elapsed_ms = elapsed.as_millis(),
                    "suppressing turn inside spacing window"
                );
                return None;
            }
        }

        self.remember(normalized.clone());
        self.last_accepted = Some(event.timestamp);

        Some(Utterance {
            normalized_text: normalized,
            raw_text: text.to_string(),
            turn_started_at: started_at,
        })
    }

    fn remember(&mut self, normalized: String) {
        while self.recent_order.len() >= self.config.recent_turn_capacity {
            match self.recent_order.pop_front() {
                Some(oldest) => {
                    self.recent.remove(&oldest);
                }
                None => break,
            }
        }
        self.recent.insert(normalized.clone());
        self.recent_order.push_back(normalized);
    }
}
