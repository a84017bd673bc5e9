//! WebSocket conversation tests against a live listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use voice_relay::api::ApiServerBuilder;
use voice_relay::config::BusyPolicy;
use voice_relay::voice::{RecognitionEvent, TranscriptEvent};
use voice_relay::{Config, Providers};

mod common;
use common::{
    EchoStreamingSynthesizer, RecordingSynthesizer, ScriptedGenerator, ScriptedRecognizer,
    fake_providers, streaming_providers,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(providers: Providers) -> SocketAddr {
    start_server_with(Config::default(), providers).await
}

async fn start_server_with(config: Config, providers: Providers) -> SocketAddr {
    let router = ApiServerBuilder::new(config)
        .providers(providers)
        .build()
        .router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let hello = next_json(&mut client).await.unwrap();
    assert_eq!(hello["type"], "status");
    assert_eq!(hello["message"], "connected");
    client
}

/// Next JSON message, or `None` once the server hangs up
async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for server");
        match message {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

/// Collect messages until one of the given type arrives
async fn collect_until(client: &mut Client, kind: &str) -> Vec<Value> {
    let mut seen = Vec::new();
    while let Some(message) = next_json(client).await {
        let done = message["type"] == kind;
        seen.push(message);
        if done {
            return seen;
        }
    }
    panic!("connection closed before {kind}: {seen:?}");
}

/// Keep reading until `count` messages of the given type have arrived
async fn collect_count(client: &mut Client, kind: &str, count: usize) -> Vec<Value> {
    let mut seen = Vec::new();
    while seen.iter().filter(|m: &&Value| m["type"] == kind).count() < count {
        match next_json(client).await {
            Some(message) => seen.push(message),
            None => panic!("connection closed before {count} {kind}: {seen:?}"),
        }
    }
    seen
}

fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}

fn decode(audio: &Value) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(audio["b64"].as_str().unwrap())
        .unwrap()
}

async fn send_frame(client: &mut Client) {
    client
        .send(Message::binary(vec![0u8; 640]))
        .await
        .unwrap();
}

async fn ping(client: &mut Client) {
    client
        .send(Message::text(r#"{"type":"ping"}"#))
        .await
        .unwrap();
}

fn position(messages: &[Value], kind: &str) -> usize {
    messages
        .iter()
        .position(|m| m["type"] == kind)
        .unwrap_or_else(|| panic!("no {kind} in {messages:?}"))
}

#[tokio::test]
async fn test_spoken_turn_gets_spoken_reply() {
    let recognizer = Arc::new(ScriptedRecognizer::new(&["What time is it"]));
    let generator = Arc::new(ScriptedGenerator::new(&["It is noon. ", "Enjoy!"]));
    let synth = Arc::new(RecordingSynthesizer::new());
    let addr = start_server(fake_providers(recognizer.clone(), generator, synth)).await;
    let mut client = connect(addr).await;

    client
        .send(Message::binary(vec![0u8; 640]))
        .await
        .unwrap();

    let mut messages = collect_until(&mut client, "assistant").await;
    while messages
        .iter()
        .filter(|m| m["type"] == "audio")
        .count()
        < 2
    {
        messages.push(next_json(&mut client).await.unwrap());
    }

    assert!(position(&messages, "transcription") < position(&messages, "turn_end"));
    assert!(position(&messages, "turn_end") < position(&messages, "assistant_delta"));

    let turn_end = &messages[position(&messages, "turn_end")];
    assert_eq!(turn_end["text"], "What time is it");

    let assistant = &messages[position(&messages, "assistant")];
    assert_eq!(assistant["text"], "It is noon. Enjoy!");

    let audio: Vec<&Value> = messages.iter().filter(|m| m["type"] == "audio").collect();
    let first = base64::engine::general_purpose::STANDARD
        .decode(audio[0]["b64"].as_str().unwrap())
        .unwrap();
    assert_eq!(first, b"audio:It is noon.");
    assert_eq!(audio[0]["sequence"], 0);
    assert_eq!(audio[1]["sequence"], 1);

    assert_eq!(recognizer.connect_count(), 1);
}

#[tokio::test]
async fn test_partial_then_final_turn_is_spoken_in_order() {
    let now = Instant::now();
    let recognizer = Arc::new(ScriptedRecognizer::from_steps(vec![vec![
        RecognitionEvent::Transcript(TranscriptEvent::partial("hello world", now)),
        RecognitionEvent::Transcript(TranscriptEvent::end_of_turn("Hello world.", now)),
    ]]));
    let generator = Arc::new(ScriptedGenerator::new(&["Hi", " there", "! How are", " you?"]));
    let synth = Arc::new(RecordingSynthesizer::new());
    let addr = start_server(fake_providers(recognizer, generator.clone(), synth.clone())).await;
    let mut client = connect(addr).await;

    send_frame(&mut client).await;
    let mut messages = collect_until(&mut client, "assistant").await;
    let heard = of_type(&messages, "audio").len();
    messages.extend(collect_count(&mut client, "audio", 2 - heard).await);

    let transcripts = of_type(&messages, "transcription");
    assert_eq!(transcripts[0]["text"], "hello world");
    assert_eq!(transcripts[0]["end_of_turn"], false);
    assert_eq!(transcripts[1]["text"], "Hello world.");
    assert_eq!(transcripts[1]["end_of_turn"], true);

    let turn_ends = of_type(&messages, "turn_end");
    assert_eq!(turn_ends.len(), 1);
    assert_eq!(turn_ends[0]["text"], "Hello world.");

    let deltas: Vec<&str> = of_type(&messages, "assistant_delta")
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(deltas, vec!["Hi", " there", "! How are", " you?"]);

    let audio = of_type(&messages, "audio");
    assert_eq!(audio[0]["sequence"], 0);
    assert_eq!(decode(audio[0]), b"audio:Hi there!");
    assert_eq!(audio[1]["sequence"], 1);
    assert_eq!(decode(audio[1]), b"audio:How are you?");

    assert_eq!(of_type(&messages, "assistant")[0]["text"], "Hi there! How are you?");
    assert_eq!(generator.seen(), vec![("Hello world.".to_string(), 0)]);
    assert_eq!(synth.sentences(), vec!["Hi there!", "How are you?"]);
}

#[tokio::test]
async fn test_busy_turn_is_dropped_by_default() {
    let recognizer = Arc::new(ScriptedRecognizer::new(&["first question", "second question"]));
    let generator = Arc::new(ScriptedGenerator::new(&["Sure."]));
    let gate = Arc::new(Semaphore::new(0));
    let synth = Arc::new(RecordingSynthesizer::new().gated(gate.clone()));
    let addr = start_server(fake_providers(recognizer, generator.clone(), synth)).await;
    let mut client = connect(addr).await;

    send_frame(&mut client).await;
    collect_until(&mut client, "turn_end").await;
    send_frame(&mut client).await;
    let second = collect_until(&mut client, "turn_end").await;
    assert_eq!(second.last().unwrap()["text"], "second question");

    gate.add_permits(4);
    collect_until(&mut client, "audio").await;
    ping(&mut client).await;
    collect_until(&mut client, "pong").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(generator.seen(), vec![("first question".to_string(), 0)]);
}

#[tokio::test]
async fn test_busy_turn_is_queued_when_configured() {
    let mut config = Config::default();
    config.turns.busy_policy = BusyPolicy::Queue;
    let recognizer = Arc::new(ScriptedRecognizer::new(&["first question", "second question"]));
    let generator = Arc::new(ScriptedGenerator::new(&["Sure."]));
    let gate = Arc::new(Semaphore::new(0));
    let synth = Arc::new(RecordingSynthesizer::new().gated(gate.clone()));
    let addr = start_server_with(config, fake_providers(recognizer, generator.clone(), synth)).await;
    let mut client = connect(addr).await;

    send_frame(&mut client).await;
    collect_until(&mut client, "turn_end").await;
    send_frame(&mut client).await;
    collect_until(&mut client, "turn_end").await;

    gate.add_permits(4);
    let messages = collect_count(&mut client, "audio", 2).await;

    assert_eq!(of_type(&messages, "audio")[1]["sequence"], 0);
    // The queued turn sees the first exchange in its history
    assert_eq!(
        generator.seen(),
        vec![
            ("first question".to_string(), 0),
            ("second question".to_string(), 2)
        ]
    );
}

#[tokio::test]
async fn test_disconnect_mid_run_releases_session() {
    let recognizer = Arc::new(ScriptedRecognizer::new(&["tell me a story"]));
    let generator = Arc::new(ScriptedGenerator::new(&["Once upon a time. "]).hanging());
    let synth = Arc::new(EchoStreamingSynthesizer::new());
    let addr = start_server(streaming_providers(recognizer, generator, synth.clone())).await;
    let mut client = connect(addr).await;

    send_frame(&mut client).await;
    let messages = collect_until(&mut client, "audio").await;
    assert_eq!(decode(messages.last().unwrap()), b"chunk:Once upon a time.");
    assert_eq!(synth.live_sessions(), 2);

    client.close(None).await.unwrap();

    assert!(synth.wait_released().await);
}

#[tokio::test]
async fn test_recognition_error_cancels_run_and_keeps_connection() {
    let recognizer =
        Arc::new(ScriptedRecognizer::new(&["tell me a story"]).then_error("stream dropped"));
    let generator = Arc::new(ScriptedGenerator::new(&["Once upon a time. "]).hanging());
    let synth = Arc::new(EchoStreamingSynthesizer::new());
    let addr =
        start_server(streaming_providers(recognizer.clone(), generator, synth.clone())).await;
    let mut client = connect(addr).await;

    send_frame(&mut client).await;
    collect_until(&mut client, "audio").await;

    send_frame(&mut client).await;
    let messages = collect_until(&mut client, "error").await;
    let error = messages.last().unwrap();
    assert_eq!(error["code"], "recognition_error");
    assert!(error["message"].as_str().unwrap().contains("stream dropped"));
    assert!(synth.wait_released().await);

    ping(&mut client).await;
    collect_until(&mut client, "pong").await;

    // The next frame opens a fresh session
    send_frame(&mut client).await;
    let reopened = collect_until(&mut client, "status").await;
    assert_eq!(reopened.last().unwrap()["message"], "listening");
    assert_eq!(recognizer.connect_count(), 2);
}

#[tokio::test]
async fn test_ping_pong() {
    let addr = start_server(Providers::default()).await;
    let mut client = connect(addr).await;

    client
        .send(Message::text(r#"{"type":"ping"}"#))
        .await
        .unwrap();

    let reply = next_json(&mut client).await.unwrap();
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn test_invalid_message_keeps_connection() {
    let addr = start_server(Providers::default()).await;
    let mut client = connect(addr).await;

    client.send(Message::text("not json")).await.unwrap();
    let reply = next_json(&mut client).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_message");

    client
        .send(Message::text(r#"{"type":"ping"}"#))
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "pong");
}

#[tokio::test]
async fn test_audio_without_recognition_is_reported_once() {
    let addr = start_server(Providers::default()).await;
    let mut client = connect(addr).await;

    client.send(Message::binary(vec![0u8; 320])).await.unwrap();
    client.send(Message::binary(vec![0u8; 320])).await.unwrap();
    client
        .send(Message::text(r#"{"type":"ping"}"#))
        .await
        .unwrap();

    let reply = next_json(&mut client).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "not_configured");
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "pong");
}

#[tokio::test]
async fn test_eof_ends_connection() {
    let addr = start_server(Providers::default()).await;
    let mut client = connect(addr).await;

    client.send(Message::text("EOF")).await.unwrap();

    assert!(next_json(&mut client).await.is_none());
}
