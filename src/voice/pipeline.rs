//! Per-turn pipeline coordination
//!
//! One run per accepted utterance. The producer streams the reply, splits it
//! into sentences and pushes them into a bounded queue; the consumer turns
//! each sentence into audio in order. A full queue suspends the producer.
//! Cancelling the run stops both sides and no further audio is emitted.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::generation::{GenerationOutcome, TextGenerator, generate};
use super::segment::{SentenceUnit, segment};
use super::synthesis::{
    AudioUnit, SpeechSynthesizer, StreamingSynthesizer, Synthesis, SynthesisSession,
};
use super::turn::Utterance;
use crate::conversation::{ConversationState, Exchange};
use crate::{Error, Result};

/// Longest wait for the next chunk of a streaming synthesis session
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Output of a run, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Reply text as it streams in
    AssistantDelta(String),
    /// Complete reply text
    Assistant(String),
    /// Synthesized audio for one sentence or session chunk
    Audio(AudioUnit),
    /// The run failed
    Error { code: &'static str, message: String },
}

/// Lifecycle of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Reply fragments are streaming in
    Generating,
    /// Generation is over; queued sentences are being synthesized
    Draining,
    Complete,
    Failed,
    Cancelled,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Complete {
        reply: String,
        audio_units: u64,
        dropped_sentences: usize,
    },
    Failed {
        code: &'static str,
        message: String,
    },
    Cancelled,
}

#[derive(Debug, Default)]
struct SynthesisReport {
    audio_units: u64,
    dropped_sentences: usize,
}

/// Runs generation and synthesis for one turn at a time
pub struct PipelineCoordinator {
    generator: Arc<dyn TextGenerator>,
    synthesis: Synthesis,
    queue_capacity: usize,
    state: watch::Sender<RunState>,
}

impl PipelineCoordinator {
    #[must_use]
    pub fn new(generator: Arc<dyn TextGenerator>, synthesis: Synthesis, queue_capacity: usize) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            generator,
            synthesis,
            queue_capacity: queue_capacity.max(1),
            state,
        }
    }

    /// Watch run state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Current run state
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Run the pipeline for one utterance
    ///
    /// The conversation is updated only when the run completes. Events are
    /// delivered in order on `events`; after `cancel` fires no further audio
    /// is sent.
    pub async fn run(
        &self,
        utterance: &Utterance,
        conversation: &mut ConversationState,
        events: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let run_id = Uuid::new_v4();
        self.state.send_replace(RunState::Generating);
        tracing::info!(%run_id, prompt = %utterance.raw_text, synthesis = self.synthesis.name(), "starting run");

        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let produce = self.produce(
            &utterance.raw_text,
            conversation.history().to_vec(),
            queue_tx,
            events,
        );
        let context_id = run_id.to_string();
        let consume = self.consume(&context_id, queue_rx, events, cancel);

        let (generation, report) = tokio::select! {
            biased;
            () = cancel.cancelled() => return self.cancelled(run_id),
            results = async { tokio::join!(produce, consume) } => results,
        };

        if cancel.is_cancelled() {
            return self.cancelled(run_id);
        }

        match generation {
            Ok(GenerationOutcome { reply, history }) => {
                conversation.replace(history);
                self.state.send_replace(RunState::Complete);
                tracing::info!(
                    %run_id,
                    audio_units = report.audio_units,
                    dropped = report.dropped_sentences,
                    "run complete"
                );
                RunOutcome::Complete {
                    reply,
                    audio_units: report.audio_units,
                    dropped_sentences: report.dropped_sentences,
                }
            }
            Err(e) => {
                self.state.send_replace(RunState::Failed);
                tracing::warn!(%run_id, error = %e, "run failed");
                let code = e.code();
                let message = e.to_string();
                if !matches!(e, Error::ConnectionClosed) {
                    let _ = events
                        .send(PipelineEvent::Error {
                            code,
                            message: message.clone(),
                        })
                        .await;
                }
                RunOutcome::Failed { code, message }
            }
        }
    }

    fn cancelled(&self, run_id: Uuid) -> RunOutcome {
        self.state.send_replace(RunState::Cancelled);
        tracing::info!(%run_id, "run cancelled");
        RunOutcome::Cancelled
    }

    async fn produce(
        &self,
        prompt: &str,
        history: Vec<Exchange>,
        queue: mpsc::Sender<SentenceUnit>,
        events: &mpsc::Sender<PipelineEvent>,
    ) -> Result<GenerationOutcome> {
        let mut generation = generate(Arc::clone(&self.generator), prompt.to_string(), history);

        let streamed: Result<()> = async {
            let fragments = generation.fragments().then(|fragment| async move {
                if let Ok(text) = &fragment {
                    let _ = events.send(PipelineEvent::AssistantDelta(text.clone())).await;
                }
                fragment
            });
            let mut sentences = std::pin::pin!(segment(fragments));
            while let Some(unit) = sentences.next().await {
                queue.send(unit?).await.map_err(|_| Error::ConnectionClosed)?;
            }
            Ok(())
        }
        .await;

        let outcome = match streamed {
            Ok(()) => generation.finish().await,
            Err(e) => Err(e),
        };
        if let Ok(outcome) = &outcome {
            let _ = events
                .send(PipelineEvent::Assistant(outcome.reply.clone()))
                .await;
        }

        drop(queue);
        self.state.send_replace(RunState::Draining);
        outcome
    }

    async fn consume(
        &self,
        context_id: &str,
        queue: mpsc::Receiver<SentenceUnit>,
        events: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> SynthesisReport {
        match &self.synthesis {
            Synthesis::OneShot(synth) => {
                synthesize_each(synth.as_ref(), queue, events, cancel).await
            }
            Synthesis::Streaming(synth) => {
                synthesize_session(synth.as_ref(), context_id, queue, events, cancel).await
            }
        }
    }
}

/// One synthesis request per sentence, strictly in queue order
async fn synthesize_each(
    synth: &dyn SpeechSynthesizer,
    mut queue: mpsc::Receiver<SentenceUnit>,
    events: &mpsc::Sender<PipelineEvent>,
    cancel: &CancellationToken,
) -> SynthesisReport {
    let mut report = SynthesisReport::default();

    while let Some(unit) = queue.recv().await {
        match synth.synthesize(&unit.text).await {
            Ok(bytes) if bytes.is_empty() => {
                tracing::warn!(sentence = %unit.text, "synthesizer returned no audio");
                report.dropped_sentences += 1;
            }
            Ok(bytes) => {
                if cancel.is_cancelled() {
                    break;
                }
                let audio = AudioUnit {
                    bytes,
                    sequence: report.audio_units,
                };
                if events.send(PipelineEvent::Audio(audio)).await.is_err() {
                    break;
                }
                report.audio_units += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, sentence = %unit.text, "skipping sentence after synthesis failure");
                report.dropped_sentences += 1;
            }
        }
    }

    report
}

/// Feed every sentence into one session while forwarding its audio
async fn synthesize_session(
    synth: &dyn StreamingSynthesizer,
    context_id: &str,
    mut queue: mpsc::Receiver<SentenceUnit>,
    events: &mpsc::Sender<PipelineEvent>,
    cancel: &CancellationToken,
) -> SynthesisReport {
    let SynthesisSession {
        mut sink,
        mut audio,
    } = match synth.open(context_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "synthesis session unavailable, reply will be text only");
            let mut report = SynthesisReport::default();
            while queue.recv().await.is_some() {
                report.dropped_sentences += 1;
            }
            return report;
        }
    };

    // Cancelled once the session stops producing audio
    let session_closed = CancellationToken::new();

    let feed = async {
        let mut dropped: usize = 0;
        while let Some(unit) = queue.recv().await {
            if session_closed.is_cancelled() {
                tracing::warn!(sentence = %unit.text, "synthesis session closed, skipping sentence");
                dropped += 1;
                continue;
            }
            if let Err(e) = sink.feed(&unit.text, unit.is_final_remainder).await {
                tracing::warn!(error = %e, sentence = %unit.text, "skipping sentence after synthesis failure");
                dropped += 1;
            }
        }
        if !session_closed.is_cancelled()
            && let Err(e) = sink.finish().await
        {
            tracing::warn!(error = %e, "failed to end synthesis session");
        }
        dropped
    };

    let drain = async {
        let mut emitted = 0;
        let mut failed: usize = 0;
        loop {
            match tokio::time::timeout(SESSION_IDLE_TIMEOUT, audio.next()).await {
                Ok(Some(Ok(bytes))) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let unit = AudioUnit {
                        bytes,
                        sequence: emitted,
                    };
                    if events.send(PipelineEvent::Audio(unit)).await.is_err() {
                        break;
                    }
                    emitted += 1;
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "synthesis session error");
                    failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("synthesis session went idle, closing it");
                    break;
                }
            }
        }
        session_closed.cancel();
        (emitted, failed)
    };

    let (unsent, (audio_units, failed)) = tokio::join!(feed, drain);
    SynthesisReport {
        audio_units,
        dropped_sentences: unsent + failed,
    }
}
