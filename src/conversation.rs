//! Per-connection conversation history

use serde::{Deserialize, Serialize};

/// Speaker of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// The assistant; named after the role the generation collaborator uses
    Model,
}

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub role: Role,
    pub content: String,
}

impl Exchange {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
        }
    }
}

/// Ordered exchange log owned by exactly one connection
///
/// The generation collaborator returns the updated history after each
/// successful turn; that history replaces this one wholesale. Failed or
/// cancelled turns leave it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    exchanges: Vec<Exchange>,
}

impl ConversationState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// History to hand to the generation collaborator
    #[must_use]
    pub fn history(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Replace the log with the collaborator's updated history
    pub fn replace(&mut self, history: Vec<Exchange>) {
        debug_assert!(
            history.starts_with(&self.exchanges),
            "updated history must extend the previous one"
        );
        self.exchanges = history;
    }

    /// Number of exchanges
    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
