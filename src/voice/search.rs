//! Web search grounding for replies
//!
//! [`SearchGrounded`] wraps a [`TextGenerator`]. Prompts that ask about
//! things that change over time are sent with a few search snippets
//! prepended; everything else goes straight through. The history keeps the
//! user's own words, not the grounded prompt.

use std::sync::Arc;

use async_trait::async_trait;

use super::generation::{FragmentStream, TextGenerator};
use crate::Result;
use crate::conversation::Exchange;

/// Snippets included in a grounded prompt
pub const MAX_SNIPPETS: usize = 5;

/// Words that suggest the answer depends on current information
const SEARCH_CUES: &[&str] = &[
    "news",
    "latest",
    "today",
    "tonight",
    "tomorrow",
    "yesterday",
    "weather",
    "forecast",
    "current",
    "currently",
    "recent",
    "recently",
    "score",
    "price",
    "stock",
    "search",
    "google",
];

/// Web search collaborator
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Result snippets for `query`, best first
    ///
    /// # Errors
    ///
    /// Returns `SearchFailed` if the backend cannot be reached or rejects the query
    async fn snippets(&self, query: &str, limit: usize) -> Result<Vec<String>>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Whether a prompt should be grounded in search results
#[must_use]
pub fn needs_search(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    if lower.contains("look up") || lower.contains("who won") || lower.contains("this week") {
        return true;
    }
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| SEARCH_CUES.contains(&word))
}

/// Prompt carrying search snippets ahead of the user's question
#[must_use]
pub fn grounded_prompt(prompt: &str, snippets: &[String]) -> String {
    let mut grounded = format!(
        "Based on the following search results, answer the user's query: '{prompt}'\n\nSearch Results:"
    );
    for snippet in snippets {
        grounded.push('\n');
        grounded.push_str(snippet);
    }
    grounded
}

/// Generator that grounds time-sensitive prompts in web search results
pub struct SearchGrounded {
    inner: Arc<dyn TextGenerator>,
    search: Arc<dyn WebSearch>,
}

impl SearchGrounded {
    #[must_use]
    pub fn new(inner: Arc<dyn TextGenerator>, search: Arc<dyn WebSearch>) -> Self {
        Self { inner, search }
    }

    async fn prompt_for(&self, prompt: &str) -> Option<String> {
        if !needs_search(prompt) {
            return None;
        }
        match self.search.snippets(prompt, MAX_SNIPPETS).await {
            Ok(snippets) if snippets.is_empty() => {
                tracing::debug!(search = self.search.name(), "no search results, answering unaided");
                None
            }
            Ok(snippets) => {
                tracing::debug!(search = self.search.name(), results = snippets.len(), "grounding reply");
                Some(grounded_prompt(prompt, &snippets))
            }
            Err(e) => {
                tracing::warn!(error = %e, "web search failed, answering unaided");
                None
            }
        }
    }
}

#[async_trait]
impl TextGenerator for SearchGrounded {
    async fn stream_reply(&self, prompt: &str, history: &[Exchange]) -> Result<FragmentStream> {
        match self.prompt_for(prompt).await {
            Some(grounded) => self.inner.stream_reply(&grounded, history).await,
            None => self.inner.stream_reply(prompt, history).await,
        }
    }

    fn updated_history(&self, history: &[Exchange], prompt: &str, reply: &str) -> Vec<Exchange> {
        self.inner.updated_history(history, prompt, reply)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
