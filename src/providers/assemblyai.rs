//! `AssemblyAI` v3 streaming recognition

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use url::Url;

use crate::config::RecognitionConfig;
use crate::voice::recognition::{RecognitionEvent, RecognitionSession, SpeechRecognizer};
use crate::voice::turn::TranscriptEvent;
use crate::{Error, Result};

const ASSEMBLYAI_STREAMING_URL: &str = "wss://streaming.assemblyai.com/v3/ws";

const TERMINATE_MESSAGE: &str = r#"{"type":"Terminate"}"#;

/// How long to wait for the `Termination` acknowledgement
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const AUDIO_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 32;

/// `AssemblyAI` streaming client
pub struct AssemblyAiRecognizer {
    api_key: SecretString,
    sample_rate: u32,
    format_turns: bool,
}

impl AssemblyAiRecognizer {
    #[must_use]
    pub fn new(api_key: SecretString, config: &RecognitionConfig) -> Self {
        Self {
            api_key,
            sample_rate: config.sample_rate,
            format_turns: config.format_turns,
        }
    }

    fn session_url(&self) -> Result<Url> {
        Url::parse_with_params(
            ASSEMBLYAI_STREAMING_URL,
            &[
                ("sample_rate", self.sample_rate.to_string()),
                ("format_turns", self.format_turns.to_string()),
                ("encoding", "pcm_s16le".to_string()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid AssemblyAI URL: {e}")))
    }
}

#[async_trait]
impl SpeechRecognizer for AssemblyAiRecognizer {
    async fn connect(&self) -> Result<RecognitionSession> {
        let mut request = self.session_url()?.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(self.api_key.expose_secret())
            .map_err(|e| Error::Config(format!("invalid AssemblyAI key: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Recognition(format!("AssemblyAI connect failed: {e}")))?;
        let (mut writer, mut reader) = socket.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let format_turns = self.format_turns;

        let task = tokio::spawn(async move {
            let mut deadline: Option<tokio::time::Instant> = None;
            loop {
                let terminating = deadline.is_some();
                tokio::select! {
                    frame = audio_rx.recv(), if !terminating => {
                        let Some(frame) = frame else {
                            deadline = Some(tokio::time::Instant::now() + TERMINATE_GRACE);
                            let _ = writer.send(Message::text(TERMINATE_MESSAGE)).await;
                            continue;
                        };
                        if let Err(e) = writer.send(Message::binary(frame)).await {
                            let _ = event_tx.send(RecognitionEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    _ = &mut shutdown_rx, if !terminating => {
                        deadline = Some(tokio::time::Instant::now() + TERMINATE_GRACE);
                        let _ = writer.send(Message::text(TERMINATE_MESSAGE)).await;
                    }
                    () = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if terminating => {
                        tracing::debug!("no termination acknowledgement from AssemblyAI");
                        break;
                    }
                    message = reader.next() => {
                        let text = match message {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(frame))) => {
                                tracing::debug!(?frame, "AssemblyAI closed the session");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = event_tx.send(RecognitionEvent::Error(e.to_string())).await;
                                break;
                            }
                            None => break,
                        };

                        let Some(event) = parse_message(text.as_str(), format_turns, Instant::now()) else {
                            continue;
                        };
                        let ended = matches!(
                            event,
                            RecognitionEvent::Terminated { .. } | RecognitionEvent::Error(_)
                        );
                        if event_tx.send(event).await.is_err() || ended {
                            break;
                        }
                    }
                }
            }
            let _ = writer.close().await;
        });

        tracing::info!(sample_rate = self.sample_rate, "opened AssemblyAI session");

        Ok(RecognitionSession::new(audio_tx, event_rx).with_task(shutdown_tx, task))
    }

    fn name(&self) -> &'static str {
        "assemblyai"
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamingMessage {
    Begin {
        id: String,
    },
    Turn {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        turn_is_formatted: bool,
    },
    Termination {
        #[serde(default)]
        audio_duration_seconds: f64,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    error: String,
}

/// Map one server message onto a recognition event
///
/// With formatted turns requested, the backend closes each turn twice: once
/// raw and once formatted. Only the formatted copy is reported as the end of
/// the turn.
fn parse_message(text: &str, format_turns: bool, received_at: Instant) -> Option<RecognitionEvent> {
    match serde_json::from_str::<StreamingMessage>(text) {
        Ok(StreamingMessage::Begin { id }) => Some(RecognitionEvent::Begin { session_id: id }),
        Ok(StreamingMessage::Turn {
            transcript,
            end_of_turn,
            turn_is_formatted,
        }) => Some(RecognitionEvent::Transcript(TranscriptEvent {
            text: transcript,
            is_final: end_of_turn,
            end_of_turn: end_of_turn && (turn_is_formatted || !format_turns),
            timestamp: received_at,
        })),
        Ok(StreamingMessage::Termination {
            audio_duration_seconds,
        }) => Some(RecognitionEvent::Terminated {
            audio_duration_seconds,
        }),
        Err(_) => match serde_json::from_str::<ErrorMessage>(text) {
            Ok(ErrorMessage { error }) => Some(RecognitionEvent::Error(error)),
            Err(e) => {
                tracing::trace!(error = %e, "ignoring AssemblyAI message");
                None
            }
        },
    }
}
