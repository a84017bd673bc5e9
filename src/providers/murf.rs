//! Murf speech synthesis
//!
//! [`MurfSpeech`] calls the HTTP streaming endpoint once per sentence.
//! [`MurfStreaming`] holds one `stream-input` WebSocket per run and feeds it
//! sentence by sentence.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::SynthesisConfig;
use crate::voice::synthesis::{
    SessionSink, SpeechSynthesizer, StreamingSynthesizer, SynthesisSession, Voice,
};
use crate::{Error, Result};

const MURF_API_BASE: &str = "https://api.murf.ai/v1/speech";
const MURF_STREAM_INPUT_URL: &str = "wss://api.murf.ai/v1/speech/stream-input";

/// Audio chunks buffered between the session reader and the pipeline
const AUDIO_CHANNEL_SIZE: usize = 16;

type MurfSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Voice settings shared by both Murf clients
#[derive(Debug, Clone)]
struct VoiceSettings {
    voice_id: String,
    style: String,
    format: String,
    sample_rate: u32,
}

impl From<&SynthesisConfig> for VoiceSettings {
    fn from(config: &SynthesisConfig) -> Self {
        Self {
            voice_id: config.voice_id.clone(),
            style: config.style.clone(),
            format: config.format.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

fn content_type_for(format: &str) -> &'static str {
    match format.to_ascii_uppercase().as_str() {
        "MP3" => "audio/mpeg",
        "FLAC" => "audio/flac",
        "OGG" => "audio/ogg",
        "PCM" => "audio/pcm",
        _ => "audio/wav",
    }
}

/// One-shot Murf client
pub struct MurfSpeech {
    client: Client,
    api_key: SecretString,
    settings: VoiceSettings,
}

impl MurfSpeech {
    #[must_use]
    pub fn new(api_key: SecretString, config: &SynthesisConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            settings: config.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for MurfSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct StreamRequest<'a> {
            text: &'a str,
            voice_id: &'a str,
            style: &'a str,
            format: &'a str,
            sample_rate: u32,
            channel_type: &'static str,
        }

        let request = StreamRequest {
            text,
            voice_id: &self.settings.voice_id,
            style: &self.settings.style,
            format: &self.settings.format,
            sample_rate: self.settings.sample_rate,
            channel_type: "MONO",
        };

        let response = self
            .client
            .post(format!("{MURF_API_BASE}/stream"))
            .header("api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::SynthesisFailed(format!("Murf request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SynthesisFailed(format!(
                "Murf TTS error {status}: {body}"
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::SynthesisFailed(format!("Murf stream interrupted: {e}")))?;
        tracing::debug!(chars = text.len(), bytes = audio.len(), "synthesized sentence");
        Ok(audio.to_vec())
    }

    async fn voices(&self) -> Result<Vec<Voice>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MurfVoice {
            voice_id: String,
            #[serde(default)]
            display_name: String,
            #[serde(default)]
            locale: String,
            #[serde(default)]
            available_styles: Vec<String>,
        }

        let response = self
            .client
            .get(format!("{MURF_API_BASE}/voices"))
            .header("api-key", self.api_key.expose_secret())
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SynthesisFailed(format!(
                "Murf voices error {status}: {body}"
            )));
        }

        let voices: Vec<MurfVoice> = response.json().await?;
        Ok(voices
            .into_iter()
            .map(|v| Voice {
                voice_id: v.voice_id,
                display_name: v.display_name,
                locale: v.locale,
                styles: v.available_styles,
            })
            .collect())
    }

    fn content_type(&self) -> &'static str {
        content_type_for(&self.settings.format)
    }

    fn name(&self) -> &'static str {
        "murf"
    }
}

/// Session-based Murf client over the `stream-input` WebSocket
pub struct MurfStreaming {
    api_key: SecretString,
    settings: VoiceSettings,
}

impl MurfStreaming {
    #[must_use]
    pub fn new(api_key: SecretString, config: &SynthesisConfig) -> Self {
        Self {
            api_key,
            settings: config.into(),
        }
    }

    fn session_url(&self) -> Result<Url> {
        let sample_rate = self.settings.sample_rate.to_string();
        Url::parse_with_params(
            MURF_STREAM_INPUT_URL,
            &[
                ("api-key", self.api_key.expose_secret()),
                ("sample_rate", sample_rate.as_str()),
                ("channel_type", "MONO"),
                ("format", self.settings.format.as_str()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid Murf URL: {e}")))
    }
}

#[derive(Serialize)]
struct VoiceConfigMessage<'a> {
    context_id: &'a str,
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    voice_id: &'a str,
    style: &'a str,
}

#[derive(Serialize)]
struct TextMessage<'a> {
    context_id: &'a str,
    text: &'a str,
    end: bool,
}

/// Frame received on the session socket
#[derive(Debug, Deserialize)]
struct SessionFrame {
    context_id: Option<String>,
    audio: Option<String>,
    #[serde(rename = "final", default)]
    is_final: bool,
    error: Option<String>,
}

#[async_trait]
impl StreamingSynthesizer for MurfStreaming {
    async fn open(&self, context_id: &str) -> Result<SynthesisSession> {
        let url = self.session_url()?;
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::SynthesisFailed(format!("Murf session connect failed: {e}")))?;
        let (mut writer, reader) = socket.split();

        let hello = VoiceConfigMessage {
            context_id,
            voice_config: VoiceConfig {
                voice_id: &self.settings.voice_id,
                style: &self.settings.style,
            },
        };
        writer
            .send(Message::text(serde_json::to_string(&hello)?))
            .await?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_SIZE);
        let reader_task = tokio::spawn(read_session(reader, context_id.to_string(), audio_tx));

        tracing::debug!(context_id, "opened Murf session");

        Ok(SynthesisSession {
            sink: Box::new(MurfSink {
                writer,
                context_id: context_id.to_string(),
                ended: false,
            }),
            audio: SessionAudio {
                inner: ReceiverStream::new(audio_rx),
                reader: reader_task,
            }
            .boxed(),
        })
    }

    fn name(&self) -> &'static str {
        "murf-stream"
    }
}

async fn read_session<S>(mut reader: S, context_id: String, audio: mpsc::Sender<Result<Vec<u8>>>)
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "Murf session closed");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = audio
                    .send(Err(Error::SynthesisFailed(format!("Murf session error: {e}"))))
                    .await;
                return;
            }
        };

        match decode_frame(text.as_str(), &context_id) {
            Ok(Some(DecodedFrame { bytes, is_final })) => {
                if !bytes.is_empty() && audio.send(Ok(bytes)).await.is_err() {
                    return;
                }
                if is_final {
                    return;
                }
            }
            Ok(None) => {}
            // An error frame covers one piece of text; the session stays usable
            Err(e) => {
                if audio.send(Err(e)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct DecodedFrame {
    bytes: Vec<u8>,
    is_final: bool,
}

/// Decode one session frame; `None` for frames of another context
fn decode_frame(text: &str, context_id: &str) -> Result<Option<DecodedFrame>> {
    let frame: SessionFrame = serde_json::from_str(text)?;

    if let Some(error) = frame.error {
        return Err(Error::SynthesisFailed(format!("Murf session: {error}")));
    }
    if frame.context_id.as_deref().is_some_and(|id| id != context_id) {
        return Ok(None);
    }

    let bytes = match frame.audio.as_deref() {
        Some(b64) if !b64.is_empty() => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| Error::SynthesisFailed(format!("invalid audio chunk: {e}")))?,
        _ => Vec::new(),
    };

    Ok(Some(DecodedFrame {
        bytes,
        is_final: frame.is_final,
    }))
}

struct MurfSink {
    writer: SplitSink<MurfSocket, Message>,
    context_id: String,
    ended: bool,
}

impl MurfSink {
    async fn send_text(&mut self, text: &str, end: bool) -> Result<()> {
        let message = TextMessage {
            context_id: &self.context_id,
            text,
            end,
        };
        self.writer
            .send(Message::text(serde_json::to_string(&message)?))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionSink for MurfSink {
    async fn feed(&mut self, text: &str, is_last: bool) -> Result<()> {
        self.send_text(text, is_last).await?;
        self.ended |= is_last;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.ended {
            self.send_text("", true).await?;
            self.ended = true;
        }
        Ok(())
    }
}

/// Audio side of a session; aborts the socket reader when dropped
struct SessionAudio {
    inner: ReceiverStream<Result<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Stream for SessionAudio {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SessionAudio {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
