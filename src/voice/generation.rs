//! Streaming text generation
//!
//! A [`TextGenerator`] produces a reply as a stream of text fragments. The
//! adapter here runs that stream on its own task and exposes it as an
//! ordered fragment channel plus a single completion slot holding the
//! final reply and the updated history.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::conversation::Exchange;
use crate::{Error, Result};

/// Fragments buffered between the generation task and its reader
const FRAGMENT_CHANNEL_SIZE: usize = 32;

/// Stream of reply fragments from a generation backend
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Chat-style text generation collaborator
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Start a reply to `prompt` given the prior `history`
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the request before streaming
    async fn stream_reply(&self, prompt: &str, history: &[Exchange]) -> Result<FragmentStream>;

    /// History after a successful reply
    fn updated_history(&self, history: &[Exchange], prompt: &str, reply: &str) -> Vec<Exchange> {
        let mut updated = Vec::with_capacity(history.len() + 2);
        updated.extend_from_slice(history);
        updated.push(Exchange::user(prompt));
        updated.push(Exchange::model(reply));
        updated
    }

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Result of a completed generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Concatenation of every fragment
    pub reply: String,
    /// History including the new exchange
    pub history: Vec<Exchange>,
}

/// An in-flight generation
///
/// Dropping it aborts the backend request.
pub struct GenerationStream {
    fragments: mpsc::Receiver<String>,
    outcome: Option<oneshot::Receiver<Result<GenerationOutcome>>>,
    /// Successful outcome already taken from the slot by `fragments`
    settled: Option<GenerationOutcome>,
    task: JoinHandle<()>,
}

impl GenerationStream {
    /// Fragments in production order, then the backend's error if it failed
    ///
    /// A successful outcome stays available to [`finish`](Self::finish).
    pub fn fragments(&mut self) -> impl Stream<Item = Result<String>> + Send + '_ {
        stream::unfold(Some(self), |this| async move {
            let this = this?;
            if let Some(fragment) = this.fragments.recv().await {
                return Some((Ok(fragment), Some(this)));
            }
            match this.outcome.take()?.await {
                Ok(Ok(outcome)) => {
                    this.settled = Some(outcome);
                    None
                }
                Ok(Err(e)) => Some((Err(e), None)),
                Err(_) => Some((
                    Err(Error::GenerationFailed("generation task ended".to_string())),
                    None,
                )),
            }
        })
    }

    /// Wait for the completion slot
    ///
    /// Fragments not yet read are discarded.
    ///
    /// # Errors
    ///
    /// Returns `GenerationFailed` if the backend failed or produced nothing
    pub async fn finish(&mut self) -> Result<GenerationOutcome> {
        if let Some(outcome) = self.settled.take() {
            return Ok(outcome);
        }
        while self.fragments.recv().await.is_some() {}

        let Some(outcome) = self.outcome.take() else {
            return Err(Error::GenerationFailed("generation already finished".to_string()));
        };
        outcome
            .await
            .unwrap_or_else(|_| Err(Error::GenerationFailed("generation task ended".to_string())))
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start generating a reply on a background task
#[must_use]
pub fn generate(
    generator: Arc<dyn TextGenerator>,
    prompt: String,
    history: Vec<Exchange>,
) -> GenerationStream {
    let (fragment_tx, fragment_rx) = mpsc::channel(FRAGMENT_CHANNEL_SIZE);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let result = drive(generator.as_ref(), &prompt, &history, &fragment_tx)
            .await
            .map_err(into_generation_error);
        if let Err(e) = &result {
            tracing::warn!(backend = generator.name(), error = %e, "generation failed");
        }
        drop(fragment_tx);
        let _ = outcome_tx.send(result);
    });

    GenerationStream {
        fragments: fragment_rx,
        outcome: Some(outcome_rx),
        settled: None,
        task,
    }
}

async fn drive(
    generator: &dyn TextGenerator,
    prompt: &str,
    history: &[Exchange],
    fragments: &mpsc::Sender<String>,
) -> Result<GenerationOutcome> {
    let mut stream = generator.stream_reply(prompt, history).await?;
    let mut reply = String::new();

    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        if fragment.is_empty() {
            continue;
        }
        reply.push_str(&fragment);
        if fragments.send(fragment).await.is_err() {
            return Err(Error::ConnectionClosed);
        }
    }

    if reply.trim().is_empty() {
        return Err(Error::GenerationFailed("empty response".to_string()));
    }

    let history = generator.updated_history(history, prompt, &reply);
    tracing::debug!(
        backend = generator.name(),
        reply_chars = reply.len(),
        "generation complete"
    );
    Ok(GenerationOutcome { reply, history })
}

fn into_generation_error(e: Error) -> Error {
    match e {
        Error::GenerationFailed(_) | Error::ConnectionClosed => e,
        other => Error::GenerationFailed(other.to_string()),
    }
}
