//! Integration tests for the HTTP API and WebSocket event stream.
//!
//! Each test serves the real router on a loopback port, drives the session
//! over HTTP with reqwest and watches events on one or more WebSocket
//! clients.

mod support;

use std::sync::Arc;
use std::time::Duration;

use codequest_engine::{
    create_router, AppState, Catalog, RunOutcome, Session, SessionEvent, SessionSettings,
    SubmitOutcome, TerminalState,
};
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::json;
use support::{SumSandbox, SUM_PROGRAM};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    base_url: String,
    ws_url: String,
    http: reqwest::Client,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn connect(&self) -> WsClient {
        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .expect("Failed to connect to WebSocket");
        ws_stream
    }

    async fn put_source(&self, source: &str) -> StatusCode {
        self.http
            .put(self.url("/api/session/source"))
            .json(&json!({ "source": source }))
            .send()
            .await
            .expect("Request failed")
            .status()
    }

    async fn run(&self) -> RunOutcome {
        self.http
            .post(self.url("/api/session/run"))
            .send()
            .await
            .expect("Request failed")
            .json()
            .await
            .expect("Run response should be JSON")
    }

    async fn input(&self, line: &str) -> RunOutcome {
        self.http
            .post(self.url("/api/session/input"))
            .json(&json!({ "line": line }))
            .send()
            .await
            .expect("Request failed")
            .json()
            .await
            .expect("Input response should be JSON")
    }
}

/// Serves a session on the built-in catalog and returns the URLs.
async fn spawn_test_server(sandbox: Arc<SumSandbox>) -> TestServer {
    let session = Session::new(
        Arc::new(Catalog::builtin()),
        sandbox,
        SessionSettings::default(),
    )
    .expect("Session should open");
    let state = AppState::new(session, Duration::from_millis(20));
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        http: reqwest::Client::new(),
        _handle: handle,
    }
}

/// Receives the next event, answering pings on the way.
async fn receive_event(client: &mut WsClient) -> SessionEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {}
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

/// Skips events until one satisfies `predicate`.
async fn wait_for<F>(client: &mut WsClient, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = receive_event(client).await;
        if predicate(&event) {
            return event;
        }
    }
}

fn is_transcript_in(state: TerminalState) -> impl FnMut(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::Transcript(p) if p.state == state)
}

// ============================================================================
// Connection
// ============================================================================

#[tokio::test]
async fn test_connected_event_carries_session_view() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;

    let mut client = server.connect().await;
    let event = receive_event(&mut client).await;

    let SessionEvent::Connected(payload) = event else {
        panic!("Expected Connected event, got: {event:?}");
    };
    assert_eq!(payload.session.challenge_index, 0);
    assert_eq!(payload.session.challenge.id, "sum-of-two");
    assert_eq!(payload.session.state, TerminalState::Idle);
    assert!(payload.session.transcript.is_empty());
    assert!(!payload.session.closed);
}

#[tokio::test]
async fn test_connected_event_reflects_current_source() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;
    assert_eq!(server.put_source(SUM_PROGRAM).await, StatusCode::ACCEPTED);

    let mut client = server.connect().await;
    let SessionEvent::Connected(payload) = receive_event(&mut client).await else {
        panic!("Expected Connected event");
    };
    assert_eq!(payload.session.source, SUM_PROGRAM);
}

// ============================================================================
// Run flow
// ============================================================================

#[tokio::test]
async fn test_interactive_run_streams_transcript_events() {
    let sandbox = Arc::new(SumSandbox::new());
    let server = spawn_test_server(sandbox.clone()).await;
    let mut client = server.connect().await;
    receive_event(&mut client).await;

    server.put_source(SUM_PROGRAM).await;
    let outcome = server.run().await;
    assert_eq!(outcome.state, TerminalState::AwaitingInput);

    let event = wait_for(&mut client, is_transcript_in(TerminalState::AwaitingInput)).await;
    let SessionEvent::Transcript(payload) = event else {
        unreachable!()
    };
    assert_eq!(payload.transcript, "First: ");

    server.input("3").await;
    let outcome = server.input("4").await;
    assert_eq!(outcome.state, TerminalState::Idle);
    assert_eq!(outcome.failure, None);

    wait_for(&mut client, is_transcript_in(TerminalState::Executing)).await;
    let event = wait_for(&mut client, is_transcript_in(TerminalState::Idle)).await;
    let SessionEvent::Transcript(payload) = event else {
        unreachable!()
    };
    assert!(payload.transcript.starts_with("First: 3\n"));
    assert!(payload.transcript.ends_with("Sum: 7\n"));
    assert_eq!(sandbox.calls(), 1);
}

#[tokio::test]
async fn test_compile_error_publishes_diagnostics() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;
    let mut client = server.connect().await;
    receive_event(&mut client).await;

    let broken = SUM_PROGRAM.replace("Console.WriteLine(\"Sum: \"", "BROKEN(\"Sum: \"");
    server.put_source(&broken).await;
    let mut outcome = server.run().await;
    while outcome.state == TerminalState::AwaitingInput {
        outcome = server.input("1").await;
    }

    let event = wait_for(&mut client, |event| {
        matches!(event, SessionEvent::Diagnostics(p) if !p.diagnostics.is_empty())
    })
    .await;
    let SessionEvent::Diagnostics(payload) = event else {
        unreachable!()
    };
    assert!(payload.diagnostics[0].message.contains("BROKEN"));
    assert_eq!(payload.markers.len(), payload.diagnostics.len());
}

#[tokio::test]
async fn test_source_edit_publishes_debounced_lint() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;
    let mut client = server.connect().await;
    receive_event(&mut client).await;

    let status = server
        .put_source("class Program {\n static void Main() {\n Console.WriteLine(1);\n}\n")
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let event = wait_for(&mut client, |event| {
        matches!(event, SessionEvent::Diagnostics(p) if !p.diagnostics.is_empty())
    })
    .await;
    assert_eq!(event.event_name(), "diagnostics");
}

#[tokio::test]
async fn test_submit_publishes_progress_then_verification() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;
    let mut client = server.connect().await;
    receive_event(&mut client).await;

    server.put_source(SUM_PROGRAM).await;
    let outcome: SubmitOutcome = server
        .http
        .post(server.url("/api/session/submit"))
        .send()
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("Submit response should be JSON");
    assert!(outcome.report.passed, "{}", outcome.report.message);

    let event = wait_for(&mut client, |event| {
        matches!(
            event,
            SessionEvent::Progress(_) | SessionEvent::Verification(_)
        )
    })
    .await;
    let SessionEvent::Progress(progress) = event else {
        panic!("Expected Progress before Verification, got: {event:?}");
    };
    assert_eq!(progress.delta.challenge_id, "sum-of-two");
    assert!(progress.sync.is_none());

    let event = receive_event(&mut client).await;
    let SessionEvent::Verification(verification) = event else {
        panic!("Expected Verification event, got: {event:?}");
    };
    assert!(verification.report.passed);
}

// ============================================================================
// Multiple clients
// ============================================================================

#[tokio::test]
async fn test_every_client_receives_events() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = server.connect().await;
        receive_event(&mut client).await;
        clients.push(client);
    }

    server.put_source(SUM_PROGRAM).await;
    server.run().await;

    for client in &mut clients {
        let event = wait_for(client, is_transcript_in(TerminalState::AwaitingInput)).await;
        assert_eq!(event.event_name(), "transcript");
    }
}

#[tokio::test]
async fn test_client_disconnect_does_not_affect_others() {
    let server = spawn_test_server(Arc::new(SumSandbox::new())).await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;
    receive_event(&mut first).await;
    receive_event(&mut second).await;

    first.close(None).await.expect("Failed to close");
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.put_source(SUM_PROGRAM).await;
    server.run().await;
    wait_for(&mut second, is_transcript_in(TerminalState::AwaitingInput)).await;
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_close_abandons_run_and_rejects_later_calls() {
    let sandbox = Arc::new(SumSandbox::with_delay(Duration::from_secs(30)));
    let server = spawn_test_server(sandbox.clone()).await;
    server
        .put_source("using System;\nclass Program\n{\n    static void Main()\n    {\n        Console.WriteLine(1 + 1);\n    }\n}\n")
        .await;

    let http = server.http.clone();
    let run_url = server.url("/api/session/run");
    let run = tokio::spawn(async move { http.post(run_url).send().await });
    while sandbox.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = server
        .http
        .post(server.url("/api/session/close"))
        .send()
        .await
        .expect("Request failed")
        .status();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let response = timeout(Duration::from_secs(5), run)
        .await
        .expect("Run should end promptly after close")
        .expect("Task panicked")
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::GONE);

    let view: serde_json::Value = server
        .http
        .get(server.url("/api/session"))
        .send()
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("View should be JSON");
    assert_eq!(view["closed"], true);
    assert_eq!(view["state"], "idle");
}
