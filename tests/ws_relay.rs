//! End-to-end tests: a real server on an ephemeral port, driven by a
//! WebSocket client, with an in-process speech provider.

use actix_web::dev::ServerHandle;
use actix_web::web::Bytes;
use actix_web::{web, App, HttpServer};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voice_relay::claims::InMemoryClaimsStore;
use voice_relay::config::AppConfig;
use voice_relay::pipeline::responder::EchoResponder;
use voice_relay::pipeline::{AudioStream, PipelineResult, SpeechProvider};
use voice_relay::state::AppState;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transcribes everything to a fixed phrase and speaks a fixed set of chunks.
struct ScriptedSpeech {
    transcript: String,
    spoken: Vec<&'static [u8]>,
    received: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedSpeech {
    fn new(transcript: &str, spoken: Vec<&'static [u8]>) -> Self {
        Self {
            transcript: transcript.to_string(),
            spoken,
            received: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SpeechProvider for ScriptedSpeech {
    async fn transcribe(&self, audio: Vec<u8>) -> PipelineResult<String> {
        self.received.lock().unwrap().push(audio);
        Ok(self.transcript.clone())
    }

    async fn synthesize(&self, _text: String) -> PipelineResult<AudioStream> {
        let chunks: Vec<PipelineResult<Bytes>> =
            self.spoken.iter().map(|chunk| Ok(Bytes::from_static(chunk))).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

fn test_config(max_sessions: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.performance.max_concurrent_sessions = max_sessions;
    config.relay.debounce_ms = 20;
    config.relay.max_batch_delay_ms = 100;
    config
}

async fn spawn_server(state: AppState) -> (SocketAddr, ServerHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let data = web::Data::new(state);

    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(voice_relay::configure))
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (addr, handle)
}

async fn connect(addr: SocketAddr) -> Result<Client, WsError> {
    connect_async(format!("ws://{}/ws/voice-agent", addr))
        .await
        .map(|(client, _)| client)
}

/// Next data message, skipping heartbeats.
async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no message from server")
            .expect("connection closed")
            .expect("websocket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

/// Finish the close handshake so the server has no open connections left.
async fn close(mut client: Client) {
    client.close(None).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await;
}

/// Collect one spoken reply: reply text, then audio between start and stop.
async fn read_reply(client: &mut Client) -> (String, Vec<u8>) {
    let text = match next_message(client).await {
        Message::Text(text) => text,
        other => panic!("expected reply text, got {:?}", other),
    };
    assert_eq!(next_message(client).await, Message::Text("start".to_string()));

    let mut audio = Vec::new();
    loop {
        match next_message(client).await {
            Message::Binary(chunk) => audio.extend_from_slice(&chunk),
            Message::Text(token) if token == "stop" => return (text, audio),
            other => panic!("unexpected message while speaking: {:?}", other),
        }
    }
}

fn state_with(speech: Arc<ScriptedSpeech>, config: AppConfig) -> AppState {
    AppState::with_components(
        config,
        speech,
        Arc::new(EchoResponder),
        Arc::new(InMemoryClaimsStore::default()),
    )
}

#[actix_web::test]
async fn test_full_voice_turn() {
    let speech = Arc::new(ScriptedSpeech::new("where is my claim", vec![b"aa", b"bb", b"cc"]));
    let (addr, handle) = spawn_server(state_with(speech.clone(), test_config(4))).await;
    let mut client = connect(addr).await.unwrap();

    client.send(Message::Text("start".to_string())).await.unwrap();
    for byte in 1..=5u8 {
        client.send(Message::Binary(vec![byte; 320])).await.unwrap();
    }
    client.send(Message::Text("stop".to_string())).await.unwrap();

    let (text, audio) = read_reply(&mut client).await;
    assert_eq!(text, "where is my claim");
    assert_eq!(audio, b"aabbcc".to_vec());

    let received = speech.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let expected: Vec<u8> = (1..=5u8).flat_map(|byte| vec![byte; 320]).collect();
    assert_eq!(received[0], expected);

    close(client).await;
    handle.stop(true).await;
}

#[actix_web::test]
async fn test_capacity_is_enforced_at_handshake() {
    let speech = Arc::new(ScriptedSpeech::new("hello", vec![b"x"]));
    let state = state_with(speech, test_config(1));
    let (addr, handle) = spawn_server(state.clone()).await;

    let mut first = connect(addr).await.unwrap();

    match connect(addr).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 503),
        Err(other) => panic!("expected an HTTP rejection, got {:?}", other),
        Ok(_) => panic!("second session should have been rejected"),
    }
    assert_eq!(state.counters.snapshot().rejected, 1);
    assert_eq!(state.registry.len(), 1);

    // The existing session is unaffected
    first.send(Message::Text("what is covered".to_string())).await.unwrap();
    let (text, audio) = read_reply(&mut first).await;
    assert_eq!(text, "what is covered");
    assert_eq!(audio, b"x".to_vec());

    close(first).await;
    handle.stop(true).await;
}

#[actix_web::test]
async fn test_malformed_text_keeps_connection_open() {
    let speech = Arc::new(ScriptedSpeech::new("still here", vec![b"ok"]));
    let (addr, handle) = spawn_server(state_with(speech, test_config(4))).await;
    let mut client = connect(addr).await.unwrap();

    let invalid = Frame::message(vec![0xff, 0xfe, 0xfd], OpCode::Data(Data::Text), true);
    client.send(Message::Frame(invalid)).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::Text("error".to_string()));

    client.send(Message::Text("start".to_string())).await.unwrap();
    client.send(Message::Binary(vec![9; 64])).await.unwrap();
    client.send(Message::Text("stop".to_string())).await.unwrap();
    let (text, _) = read_reply(&mut client).await;
    assert_eq!(text, "still here");

    close(client).await;
    handle.stop(true).await;
}

#[actix_web::test]
async fn test_disconnect_releases_session() {
    let speech = Arc::new(ScriptedSpeech::new("bye", vec![b"z"]));
    let state = state_with(speech, test_config(1));
    let (addr, handle) = spawn_server(state.clone()).await;

    let mut client = connect(addr).await.unwrap();
    client.send(Message::Text("start".to_string())).await.unwrap();
    let listed: serde_json::Value = reqwest::get(format!("http://{}/api/v1/sessions", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["count"], 1);

    close(client).await;

    for _ in 0..200 {
        if state.registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(state.registry.is_empty());

    // The slot is free again
    let again = connect(addr).await.unwrap();
    close(again).await;

    handle.stop(true).await;
}
