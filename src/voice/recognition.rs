//! Streaming speech recognition sessions

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::turn::TranscriptEvent;
use crate::{Error, Result};

/// Event emitted by a recognition session
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Session accepted by the backend
    Begin { session_id: String },
    /// Partial or end-of-turn transcript
    Transcript(TranscriptEvent),
    /// Backend closed the session
    Terminated { audio_duration_seconds: f64 },
    /// Backend reported a failure; the session is no longer usable
    Error(String),
}

/// Streaming recognition collaborator
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a session that accepts raw PCM frames
    ///
    /// # Errors
    ///
    /// Returns `Recognition` if the backend cannot be reached
    async fn connect(&self) -> Result<RecognitionSession>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// One live recognition session
///
/// Dropping it aborts the backend connection without a graceful terminate.
pub struct RecognitionSession {
    audio: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<RecognitionEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RecognitionSession {
    /// Session backed by plain channels
    #[must_use]
    pub fn new(audio: mpsc::Sender<Vec<u8>>, events: mpsc::Receiver<RecognitionEvent>) -> Self {
        Self {
            audio,
            events,
            shutdown: None,
            task: None,
        }
    }

    /// Attach the task driving the backend connection
    ///
    /// `shutdown` asks the task to terminate gracefully.
    #[must_use]
    pub fn with_task(mut self, shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        self.shutdown = Some(shutdown);
        self.task = Some(task);
        self
    }

    /// Forward one audio frame
    ///
    /// # Errors
    ///
    /// Returns `Recognition` if the session has ended
    pub async fn send_audio(&self, frame: Vec<u8>) -> Result<()> {
        self.audio
            .send(frame)
            .await
            .map_err(|_| Error::Recognition("session closed".to_string()))
    }

    /// Next event, `None` once the session has ended
    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        self.events.recv().await
    }

    /// Terminate the session and wait for the backend to acknowledge
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
