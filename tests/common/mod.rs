//! Shared test utilities

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use voice_relay::voice::{
    FragmentStream, RecognitionEvent, RecognitionSession, SessionSink, SpeechRecognizer,
    SpeechSynthesizer, StreamingSynthesizer, Synthesis, SynthesisSession, TextGenerator,
    TranscriptEvent, Utterance, Voice,
};
use voice_relay::{Error, Exchange, Providers, Result};

/// Utterance with the given text
#[allow(dead_code)]
#[must_use]
pub fn utterance(text: &str) -> Utterance {
    Utterance {
        normalized_text: voice_relay::voice::normalize(text),
        raw_text: text.to_string(),
        turn_started_at: Instant::now(),
    }
}

/// Generator replaying fixed fragments
pub struct ScriptedGenerator {
    fragments: Vec<String>,
    /// Fail after emitting this many fragments
    fail_after: Option<usize>,
    /// Never finish after the last fragment
    hang: bool,
    /// Delay before each fragment
    pace: Option<Duration>,
    pub prompts: Mutex<Vec<(String, usize)>>,
}

#[allow(dead_code)]
impl ScriptedGenerator {
    #[must_use]
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| (*f).to_string()).collect(),
            fail_after: None,
            hang: false,
            pace: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    #[must_use]
    pub fn paced(mut self, delay: Duration) -> Self {
        self.pace = Some(delay);
        self
    }

    /// Prompts seen so far with the history length of each
    #[must_use]
    pub fn seen(&self) -> Vec<(String, usize)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn stream_reply(&self, prompt: &str, history: &[Exchange]) -> Result<FragmentStream> {
        self.prompts
            .lock()
            .unwrap()
            .push((prompt.to_string(), history.len()));

        let mut items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        if let Some(count) = self.fail_after {
            items.truncate(count);
            items.push(Err(Error::GenerationFailed("backend hung up".to_string())));
        }

        let fragments = match self.pace {
            Some(delay) => stream::iter(items)
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => stream::iter(items).boxed(),
        };
        if self.hang {
            Ok(fragments.chain(stream::pending()).boxed())
        } else {
            Ok(fragments)
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// One-shot synthesizer that records every sentence
///
/// Audio bytes are `audio:<sentence>`.
#[derive(Default)]
pub struct RecordingSynthesizer {
    pub calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
    /// When set, each call waits for a permit
    gate: Option<Arc<Semaphore>>,
}

#[allow(dead_code)]
impl RecordingSynthesizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_on(mut self, sentence: &str) -> Self {
        self.fail_on = Some(sentence.to_string());
        self
    }

    #[must_use]
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn sentences(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.calls.lock().unwrap().push(text.to_string());
        if self.fail_on.as_deref() == Some(text) {
            return Err(Error::SynthesisFailed(format!("cannot say {text}")));
        }
        Ok(format!("audio:{text}").into_bytes())
    }

    async fn voices(&self) -> Result<Vec<Voice>> {
        Ok(vec![Voice {
            voice_id: "test-voice".to_string(),
            display_name: "Test".to_string(),
            locale: "en-US".to_string(),
            styles: vec!["Conversational".to_string()],
        }])
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Decrements a live counter when dropped
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Streaming synthesizer echoing each fed sentence as one audio chunk
///
/// Feeding the `fail_on` sentence reports an error on the audio side and
/// ends it, while the sink keeps accepting text like a half-open socket.
#[allow(dead_code)]
#[derive(Default)]
pub struct EchoStreamingSynthesizer {
    /// Session halves not yet dropped
    pub live: Arc<AtomicUsize>,
    pub fed: Arc<Mutex<Vec<(String, bool)>>>,
    pub contexts: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

#[allow(dead_code)]
impl EchoStreamingSynthesizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_on(mut self, sentence: &str) -> Self {
        self.fail_on = Some(sentence.to_string());
        self
    }

    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn fed(&self) -> Vec<(String, bool)> {
        self.fed.lock().unwrap().clone()
    }

    /// Wait until every session has been dropped
    pub async fn wait_released(&self) -> bool {
        for _ in 0..200 {
            if self.live_sessions() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

struct EchoSink {
    audio: Option<mpsc::Sender<Result<Vec<u8>>>>,
    fed: Arc<Mutex<Vec<(String, bool)>>>,
    fail_on: Option<String>,
    _guard: ReleaseGuard,
}

#[async_trait]
impl SessionSink for EchoSink {
    async fn feed(&mut self, text: &str, is_last: bool) -> Result<()> {
        self.fed.lock().unwrap().push((text.to_string(), is_last));
        let Some(audio) = self.audio.take() else {
            return Ok(());
        };

        let chunk = if self.fail_on.as_deref() == Some(text) {
            Err(Error::SynthesisFailed(format!("cannot say {text}")))
        } else {
            Ok(format!("chunk:{text}").into_bytes())
        };
        let failed = chunk.is_err();
        audio
            .send(chunk)
            .await
            .map_err(|_| Error::SynthesisFailed("session closed".to_string()))?;

        if !failed && !is_last {
            self.audio = Some(audio);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.audio = None;
        Ok(())
    }
}

#[async_trait]
impl StreamingSynthesizer for EchoStreamingSynthesizer {
    async fn open(&self, context_id: &str) -> Result<SynthesisSession> {
        self.contexts.lock().unwrap().push(context_id.to_string());
        self.live.fetch_add(2, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        let stream_guard = ReleaseGuard(Arc::clone(&self.live));
        let audio = ReceiverStream::new(rx)
            .map(move |chunk| {
                let _ = &stream_guard;
                chunk
            })
            .boxed();

        Ok(SynthesisSession {
            sink: Box::new(EchoSink {
                audio: Some(tx),
                fed: Arc::clone(&self.fed),
                fail_on: self.fail_on.clone(),
                _guard: ReleaseGuard(Arc::clone(&self.live)),
            }),
            audio,
        })
    }

    fn name(&self) -> &'static str {
        "echo-stream"
    }
}

/// Recognizer that plays one scripted step per received audio frame
///
/// The script is shared by every session it opens, so a reconnect picks up
/// where the previous session stopped.
#[allow(dead_code)]
pub struct ScriptedRecognizer {
    script: Arc<Mutex<VecDeque<Vec<RecognitionEvent>>>>,
    pub connects: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedRecognizer {
    /// One finished turn per frame, far enough apart to clear the spacing window
    #[must_use]
    pub fn new(turns: &[&str]) -> Self {
        let base = Instant::now();
        let steps = (0u32..)
            .zip(turns)
            .map(|(i, text)| {
                let at = base + Duration::from_secs(5) * i;
                vec![
                    RecognitionEvent::Transcript(TranscriptEvent::partial(*text, at)),
                    RecognitionEvent::Transcript(TranscriptEvent::end_of_turn(*text, at)),
                ]
            })
            .collect();
        Self::from_steps(steps)
    }

    #[must_use]
    pub fn from_steps(steps: Vec<Vec<RecognitionEvent>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into())),
            connects: AtomicUsize::new(0),
        }
    }

    /// Fail the session on the frame after the scripted turns
    #[must_use]
    pub fn then_error(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(vec![RecognitionEvent::Error(message.to_string())]);
        self
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn connect(&self) -> Result<RecognitionSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let script = Arc::clone(&self.script);

        tokio::spawn(async move {
            while audio_rx.recv().await.is_some() {
                let step = script.lock().unwrap().pop_front();
                for event in step.unwrap_or_default() {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(RecognitionSession::new(audio_tx, event_rx))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Providers wired to fakes with one-shot synthesis
#[allow(dead_code)]
#[must_use]
pub fn fake_providers(
    recognizer: Arc<ScriptedRecognizer>,
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<RecordingSynthesizer>,
) -> Providers {
    Providers {
        recognizer: Some(recognizer),
        generator: Some(generator),
        synthesis: Some(Synthesis::OneShot(synthesizer.clone())),
        speech: Some(synthesizer),
    }
}

/// Providers wired to fakes with a streaming synthesis session
#[allow(dead_code)]
#[must_use]
pub fn streaming_providers(
    recognizer: Arc<ScriptedRecognizer>,
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<EchoStreamingSynthesizer>,
) -> Providers {
    Providers {
        recognizer: Some(recognizer),
        generator: Some(generator),
        synthesis: Some(Synthesis::Streaming(synthesizer)),
        speech: None,
    }
}
