//! WebSocket handler for voice conversations
//!
//! Binary frames carry raw PCM audio for the recognizer. Text frames carry
//! JSON control messages or the literal `EOF`.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::ApiState;
use crate::config::{ApiKeys, BusyPolicy};
use crate::conversation::ConversationState;
use crate::providers::Providers;
use crate::voice::{
    PipelineCoordinator, PipelineEvent, RecognitionEvent, RecognitionSession, RunOutcome,
    TurnAggregator, Utterance,
};
use crate::{Error, Result};

/// Literal text frame that ends the audio stream
const EOF_FRAME: &str = "EOF";

/// Messages buffered towards the client
const OUTGOING_CHANNEL_SIZE: usize = 64;

/// Pipeline events buffered per run
const RUN_EVENT_CHANNEL_SIZE: usize = 32;

/// Incoming control message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Per-connection API keys; absent keys fall back to the server's
    Config {
        #[serde(default)]
        keys: ClientKeys,
    },
    /// End of the audio stream
    Eof,
    /// Ping to keep connection alive
    Ping,
}

/// API keys supplied by a client
#[derive(Debug, Default, Deserialize)]
pub struct ClientKeys {
    pub assemblyai: Option<String>,
    pub gemini: Option<String>,
    pub murf: Option<String>,
    pub serpapi: Option<String>,
}

impl ClientKeys {
    /// Overlay non-blank client keys on the server keys
    fn merge_over(self, server: &ApiKeys) -> ApiKeys {
        let pick = |client: Option<String>, fallback: &Option<SecretString>| {
            client
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from)
                .or_else(|| fallback.clone())
        };
        ApiKeys {
            assemblyai: pick(self.assemblyai, &server.assemblyai),
            gemini: pick(self.gemini, &server.gemini),
            murf: pick(self.murf, &server.murf),
            serpapi: pick(self.serpapi, &server.serpapi),
        }
    }
}

/// Outgoing WebSocket message to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Connection or session status
    Status { message: String },
    /// Transcript update
    Transcription {
        text: String,
        is_final: bool,
        end_of_turn: bool,
    },
    /// A user turn was accepted and a reply is starting
    TurnEnd { text: String },
    /// Reply text as it streams in
    AssistantDelta { text: String },
    /// Complete reply text
    Assistant { text: String },
    /// Base64 audio for one sentence or session chunk
    Audio { b64: String, sequence: u64 },
    /// Error occurred
    Error { code: String, message: String },
    /// Pong response
    Pong,
}

impl WsOutgoing {
    fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<PipelineEvent> for WsOutgoing {
    fn from(event: PipelineEvent) -> Self {
        match event {
            PipelineEvent::AssistantDelta(text) => Self::AssistantDelta { text },
            PipelineEvent::Assistant(text) => Self::Assistant { text },
            PipelineEvent::Audio(unit) => Self::Audio {
                b64: base64::engine::general_purpose::STANDARD.encode(&unit.bytes),
                sequence: unit.sequence,
            },
            PipelineEvent::Error { code, message } => Self::error(code, message),
        }
    }
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(OUTGOING_CHANNEL_SIZE);

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg)
                && sender.send(Message::Text(text.into())).await.is_err()
            {
                break;
            }
        }
    });

    let connection_id = uuid::Uuid::new_v4();
    tracing::info!(%connection_id, "WebSocket connected");

    let mut conn = Connection::new(&state, tx);
    conn.send(WsOutgoing::status("connected")).await;

    loop {
        tokio::select! {
            message = receiver.next() => {
                let Some(Ok(message)) = message else {
                    tracing::debug!(%connection_id, "client stream ended");
                    break;
                };
                if conn.handle_message(message).await.is_err() {
                    break;
                }
            }
            event = next_recognition_event(&mut conn.recognition) => {
                conn.handle_recognition(event).await;
            }
            signal = next_run_signal(&mut conn.active) => match signal {
                RunSignal::Event(event) => conn.send(event.into()).await,
                RunSignal::Finished(joined) => conn.finish_run(joined).await,
            },
            _ = &mut send_task => {
                tracing::debug!(%connection_id, "client writer closed");
                break;
            }
        }
    }

    conn.shutdown().await;
    send_task.abort();
    tracing::info!(%connection_id, "WebSocket disconnected");
}

type RunJoin = std::result::Result<(ConversationState, RunOutcome), JoinError>;

/// A pipeline run executing on its own task
struct ActiveRun {
    cancel: CancellationToken,
    /// Dropped when the run is cancelled so buffered audio never reaches the client
    events: Option<mpsc::Receiver<PipelineEvent>>,
    handle: JoinHandle<(ConversationState, RunOutcome)>,
}

/// Per-connection state, owned by the connection task
struct Connection {
    state: Arc<ApiState>,
    providers: Providers,
    outgoing: mpsc::Sender<WsOutgoing>,
    aggregator: TurnAggregator,
    /// `None` while a run holds it
    conversation: Option<ConversationState>,
    recognition: Option<RecognitionSession>,
    /// Set after a failed connect; cleared by a `config` message
    recognition_unavailable: bool,
    active: Option<ActiveRun>,
    pending: VecDeque<Utterance>,
    busy_policy: BusyPolicy,
    cancel: CancellationToken,
}

impl Connection {
    fn new(state: &Arc<ApiState>, outgoing: mpsc::Sender<WsOutgoing>) -> Self {
        Self {
            state: Arc::clone(state),
            providers: state.providers.clone(),
            outgoing,
            aggregator: TurnAggregator::new(state.config.turns.clone()),
            conversation: Some(ConversationState::new()),
            recognition: None,
            recognition_unavailable: false,
            active: None,
            pending: VecDeque::new(),
            busy_policy: state.config.turns.busy_policy,
            cancel: CancellationToken::new(),
        }
    }

    async fn send(&self, message: WsOutgoing) {
        let _ = self.outgoing.send(message).await;
    }

    /// Handle one client frame; `Err` ends the connection
    async fn handle_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Binary(frame) => {
                self.forward_audio(frame.to_vec()).await;
                Ok(())
            }
            Message::Text(text) => self.handle_text(text.as_str()).await,
            Message::Close(_) => {
                tracing::info!("WebSocket closed by client");
                Err(Error::ConnectionClosed)
            }
            Message::Ping(data) => {
                tracing::trace!(len = data.len(), "received ping");
                Ok(())
            }
            Message::Pong(_) => Ok(()),
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<()> {
        if text.trim() == EOF_FRAME {
            tracing::info!("client signalled end of audio");
            return Err(Error::ConnectionClosed);
        }

        let incoming: WsIncoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                let err = Error::InvalidMessage(e.to_string());
                self.send(WsOutgoing::error(err.code(), err.to_string())).await;
                return Ok(());
            }
        };

        match incoming {
            WsIncoming::Eof => {
                tracing::info!("client signalled end of audio");
                return Err(Error::ConnectionClosed);
            }
            WsIncoming::Ping => self.send(WsOutgoing::Pong).await,
            WsIncoming::Config { keys } => {
                let keys = keys.merge_over(&self.state.config.api_keys);
                self.providers = Providers::from_keys(&self.state.config, &keys);
                self.recognition_unavailable = false;
                if let Some(session) = self.recognition.take() {
                    session.close().await;
                }
                tracing::info!(providers = ?self.providers, "applied client keys");
                self.send(WsOutgoing::status("configured")).await;
            }
        }
        Ok(())
    }

    async fn forward_audio(&mut self, frame: Vec<u8>) {
        if self.recognition.is_none() {
            if self.recognition_unavailable {
                return;
            }
            let Some(recognizer) = self.providers.recognizer.clone() else {
                self.recognition_unavailable = true;
                self.send(WsOutgoing::error(
                    "not_configured",
                    "speech recognition is not configured",
                ))
                .await;
                return;
            };
            match recognizer.connect().await {
                Ok(session) => {
                    self.recognition = Some(session);
                    self.send(WsOutgoing::status("listening")).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to open recognition session");
                    self.recognition_unavailable = true;
                    self.send(WsOutgoing::error(e.code(), e.to_string())).await;
                    return;
                }
            }
        }

        let sent = match &self.recognition {
            Some(session) => session.send_audio(frame).await,
            None => return,
        };
        if let Err(e) = sent {
            self.recognition_failed(e.to_string()).await;
        }
    }

    async fn handle_recognition(&mut self, event: Option<RecognitionEvent>) {
        match event {
            Some(RecognitionEvent::Begin { session_id }) => {
                tracing::debug!(%session_id, "recognition session started");
            }
            Some(RecognitionEvent::Transcript(transcript)) => {
                if transcript.text.trim().is_empty() {
                    return;
                }
                self.send(WsOutgoing::Transcription {
                    text: transcript.text.clone(),
                    is_final: transcript.is_final,
                    end_of_turn: transcript.end_of_turn,
                })
                .await;

                if let Some(utterance) = self.aggregator.ingest(&transcript) {
                    self.send(WsOutgoing::TurnEnd {
                        text: utterance.raw_text.clone(),
                    })
                    .await;
                    self.accept(utterance).await;
                }
            }
            Some(RecognitionEvent::Terminated {
                audio_duration_seconds,
            }) => {
                tracing::info!(audio_duration_seconds, "recognition session terminated");
                self.recognition = None;
            }
            Some(RecognitionEvent::Error(message)) => self.recognition_failed(message).await,
            None => {
                tracing::debug!("recognition session ended");
                self.recognition = None;
            }
        }
    }

    /// Report the failure, abandon the current run and reopen on the next frame
    async fn recognition_failed(&mut self, message: String) {
        let err = Error::Recognition(message);
        tracing::warn!(error = %err, "recognition failed");
        self.send(WsOutgoing::error(err.code(), err.to_string())).await;
        self.cancel_active();
        self.pending.clear();
        self.recognition = None;
    }

    async fn accept(&mut self, utterance: Utterance) {
        if self.active.is_some() {
            match self.busy_policy {
                BusyPolicy::Drop => {
                    tracing::warn!(text = %utterance.raw_text, "run in progress, dropping turn");
                }
                BusyPolicy::Queue => {
                    tracing::info!(text = %utterance.raw_text, "run in progress, queueing turn");
                    self.pending.push_back(utterance);
                }
            }
            return;
        }
        self.start_run(utterance).await;
    }

    async fn start_run(&mut self, utterance: Utterance) {
        let (Some(generator), Some(synthesis)) =
            (self.providers.generator.clone(), self.providers.synthesis.clone())
        else {
            self.send(WsOutgoing::error(
                "not_configured",
                format!("missing backends: {}", self.providers.missing().join(", ")),
            ))
            .await;
            return;
        };
        let Some(mut conversation) = self.conversation.take() else {
            tracing::error!("conversation state unavailable, dropping turn");
            return;
        };

        let coordinator = PipelineCoordinator::new(
            generator,
            synthesis,
            self.state.config.pipeline.queue_capacity,
        );
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let (events_tx, events_rx) = mpsc::channel(RUN_EVENT_CHANNEL_SIZE);

        let handle = tokio::spawn(async move {
            let outcome = coordinator
                .run(&utterance, &mut conversation, &events_tx, &token)
                .await;
            (conversation, outcome)
        });

        self.active = Some(ActiveRun {
            cancel,
            events: Some(events_rx),
            handle,
        });
    }

    fn cancel_active(&mut self) {
        if let Some(run) = &mut self.active {
            run.cancel.cancel();
            run.events = None;
        }
    }

    async fn finish_run(&mut self, joined: RunJoin) {
        let Some(mut run) = self.active.take() else {
            return;
        };

        // Events sent just before the task ended
        if let Some(events) = &mut run.events {
            while let Ok(event) = events.try_recv() {
                self.send(event.into()).await;
            }
        }

        match joined {
            Ok((conversation, outcome)) => {
                tracing::debug!(?outcome, exchanges = conversation.len(), "run finished");
                self.conversation = Some(conversation);
            }
            Err(e) => {
                tracing::error!(error = %e, "run task failed, starting a fresh conversation");
                self.conversation = Some(ConversationState::new());
            }
        }

        if let Some(next) = self.pending.pop_front() {
            self.start_run(next).await;
        }
    }

    /// Cancel everything and wait for the active run to let go
    async fn shutdown(mut self) {
        self.cancel.cancel();
        self.pending.clear();
        if let Some(run) = self.active.take() {
            drop(run.events);
            let _ = run.handle.await;
        }
        if let Some(session) = self.recognition.take() {
            session.close().await;
        }
    }
}

async fn next_recognition_event(session: &mut Option<RecognitionSession>) -> Option<RecognitionEvent> {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

enum RunSignal {
    Event(PipelineEvent),
    Finished(RunJoin),
}

/// Next event of the active run, or its completion once it has ended
async fn next_run_signal(active: &mut Option<ActiveRun>) -> RunSignal {
    let Some(run) = active else {
        return std::future::pending().await;
    };

    if let Some(events) = &mut run.events {
        tokio::select! {
            biased;
            Some(event) = events.recv() => return RunSignal::Event(event),
            joined = &mut run.handle => return RunSignal::Finished(joined),
        }
    }
    RunSignal::Finished((&mut run.handle).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::AudioUnit;

    #[test]
    fn parses_control_messages() {
        let config: WsIncoming =
            serde_json::from_str(r#"{"type":"config","keys":{"gemini":"g"}}"#).unwrap();
        assert!(matches!(config, WsIncoming::Config { keys } if keys.gemini.as_deref() == Some("g")));

        let eof: WsIncoming = serde_json::from_str(r#"{"type":"eof"}"#).unwrap();
        assert!(matches!(eof, WsIncoming::Eof));
        assert!(serde_json::from_str::<WsIncoming>(r#"{"type":"chat"}"#).is_err());
    }

    #[test]
    fn client_keys_fall_back_to_server() {
        use secrecy::ExposeSecret;

        let server = ApiKeys {
            gemini: Some(SecretString::from("server-gemini")),
            murf: Some(SecretString::from("server-murf")),
            ..ApiKeys::default()
        };
        let client = ClientKeys {
            assemblyai: Some("client-aai".to_string()),
            gemini: Some(" ".to_string()),
            murf: None,
            serpapi: Some("client-serp".to_string()),
        };
        let keys = client.merge_over(&server);

        assert_eq!(keys.assemblyai.unwrap().expose_secret(), "client-aai");
        assert_eq!(keys.gemini.unwrap().expose_secret(), "server-gemini");
        assert_eq!(keys.murf.unwrap().expose_secret(), "server-murf");
        assert_eq!(keys.serpapi.unwrap().expose_secret(), "client-serp");
    }

    #[test]
    fn outgoing_messages_are_tagged() {
        let json = serde_json::to_value(WsOutgoing::Transcription {
            text: "hi".to_string(),
            is_final: true,
            end_of_turn: false,
        })
        .unwrap();
        assert_eq!(json["type"], "transcription");
        assert_eq!(json["is_final"], true);

        let json = serde_json::to_value(WsOutgoing::Pong).unwrap();
        assert_eq!(json, serde_json::json!({"type": "pong"}));
    }

    #[test]
    fn audio_event_is_base64() {
        let message: WsOutgoing = PipelineEvent::Audio(AudioUnit {
            bytes: b"RIFF".to_vec(),
            sequence: 3,
        })
        .into();
        assert_eq!(
            message,
            WsOutgoing::Audio {
                b64: "UklGRg==".to_string(),
                sequence: 3
            }
        );
    }

    #[test]
    fn pipeline_error_keeps_code() {
        let message: WsOutgoing = PipelineEvent::Error {
            code: "generation_failed",
            message: "blocked".to_string(),
        }
        .into();
        assert_eq!(message, WsOutgoing::error("generation_failed", "blocked"));
    }
}
