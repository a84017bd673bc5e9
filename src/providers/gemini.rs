//! Gemini streaming chat backend

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::conversation::{Exchange, Role};
use crate::voice::generation::{FragmentStream, TextGenerator};
use crate::{Error, Result};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons that mean the reply was cut off by the backend
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

/// Gemini text generator using server-sent events
pub struct GeminiGenerator {
    client: Client,
    api_key: SecretString,
    model: String,
    system_prompt: String,
    base_url: String,
}

impl GeminiGenerator {
    /// Create a generator for the configured model
    #[must_use]
    pub fn new(api_key: SecretString, config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            base_url: GEMINI_API_BASE.to_string(),
        }
    }

    /// Point the generator at a different API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request<'a>(&'a self, prompt: &'a str, history: &'a [Exchange]) -> GenerateRequest<'a> {
        let mut contents: Vec<Content<'a>> = history
            .iter()
            .map(|e| Content {
                role: match e.role {
                    Role::User => "user",
                    Role::Model => "model",
                },
                parts: vec![Part { text: &e.content }],
            })
            .collect();
        contents.push(Content {
            role: "user",
            parts: vec![Part { text: prompt }],
        });

        GenerateRequest {
            system_instruction: (!self.system_prompt.is_empty()).then(|| SystemInstruction {
                parts: vec![Part {
                    text: &self.system_prompt,
                }],
            }),
            contents,
        }
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn stream_reply(&self, prompt: &str, history: &[Exchange]) -> Result<FragmentStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );

        tracing::debug!(model = %self.model, history = history.len(), "starting Gemini stream");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&self.request(prompt, history))
            .send()
            .await
            .map_err(|e| Error::GenerationFailed(format!("Gemini request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Gemini API error");
            return Err(Error::GenerationFailed(format!(
                "Gemini API error {status}: {body}"
            )));
        }

        Ok(fragments(response.bytes_stream().boxed()))
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    done: bool,
}

/// Turn an SSE body into reply fragments
///
/// Dropping the returned stream drops the HTTP response.
fn fragments(body: BoxStream<'static, reqwest::Result<Bytes>>) -> FragmentStream {
    let state = SseState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    for payload in st.decoder.push(&chunk) {
                        st.pending.push_back(parse_chunk(&payload));
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.pending
                        .push_back(Err(Error::GenerationFailed(format!("Gemini stream error: {e}"))));
                }
                None => {
                    st.done = true;
                    if let Some(payload) = st.decoder.finish() {
                        st.pending.push_back(parse_chunk(&payload));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Extract reply text from one streamed response chunk
fn parse_chunk(payload: &str) -> Result<String> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| Error::GenerationFailed(format!("malformed Gemini chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(Error::GenerationFailed(format!(
            "Gemini error {}: {}",
            error.code.unwrap_or_default(),
            error.message.unwrap_or_default()
        )));
    }

    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(Error::GenerationFailed(format!("prompt blocked: {reason}")));
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(String::new());
    };

    if let Some(reason) = candidate.finish_reason.as_deref()
        && BLOCKING_FINISH_REASONS.contains(&reason)
    {
        return Err(Error::GenerationFailed(format!("generation stopped: {reason}")));
    }

    Ok(candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default())
}

/// Incremental decoder for `data:` lines of a server-sent event stream
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: String,
}

impl SseDecoder {
    /// Feed raw body bytes, returning every completed event payload
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(std::mem::take(&mut self.data));
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        events
    }

    /// Flush an event left unterminated at end of body
    fn finish(&mut self) -> Option<String> {
        let tail = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        if let Some(value) = tail.trim_end().strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value.trim_start());
        }
        (!self.data.is_empty()).then(|| std::mem::take(&mut self.data))
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: Option<String>,
}
