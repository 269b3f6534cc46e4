#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::routing::get;
use browser_automation_agent::client::{
    BackoffPolicy, CONNECT_EVENT, ChannelClient, ClientConfig, ConnectionState, DISCONNECT_EVENT,
};
use browser_automation_agent::config::WorkerConfig;
use browser_automation_agent::registry::SessionRegistry;
use browser_automation_agent::server::{self, AppState, HEALTH_PATH, WS_PATH};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

const WAIT: Duration = Duration::from_secs(15);

struct TestServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server(script: &str) -> TestServer {
    let registry = SessionRegistry::new(
        WorkerConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "worker".into()],
            stop_grace: Duration::from_millis(300),
            ..Default::default()
        },
        64,
    );
    let listener = server::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(
        listener,
        AppState::new(Arc::new(registry)),
        async move {
            let _ = rx.await;
        },
    ));
    TestServer {
        url: format!("http://{addr}"),
        shutdown: Some(tx),
    }
}

/// Connects and forwards every server event into a channel.
async fn connect(server: &TestServer) -> (ChannelClient, mpsc::UnboundedReceiver<(String, Value)>) {
    let client = ChannelClient::connect(ClientConfig::new(&server.url));
    let (tx, rx) = mpsc::unbounded_channel();
    for event in ["log", "screenshot", "complete", "error"] {
        let tx = tx.clone();
        client.on(event, move |data| {
            let _ = tx.send((event.to_string(), data.clone()));
        });
    }
    client.wait_connected(WAIT).await.unwrap();
    (client, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn until_complete(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = event.0 == "complete";
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn submitted_task_streams_events_and_completes() {
    let server = start_server(
        r#"echo '{"type":"system","message":"navigating"}'
echo '{"type":"screenshot","data":"aGVsbG8="}'
echo 'plain progress line'
echo '{"type":"result","message":"found 3 items"}'"#,
    )
    .await;
    let (client, mut rx) = connect(&server).await;

    assert!(client.emit(
        "submit",
        json!({"prompt": "list items", "options": {"model": "llama3"}})
    ));
    let events = until_complete(&mut rx).await;

    let (first, data) = &events[0];
    assert_eq!(first, "log");
    assert_eq!(data["kind"], "system");
    assert_eq!(data["text"], "Starting automation with task: list items");

    let tail: Vec<(String, Value)> = events
        .iter()
        .filter(|(name, data)| name != "log" || data["kind"] != "config")
        .skip(1)
        .cloned()
        .collect();
    assert_eq!(tail.len(), 5, "{tail:?}");
    assert_eq!(tail[0].1["text"], "navigating");
    assert_eq!(tail[1], ("screenshot".to_string(), json!({"data": "aGVsbG8="})));
    assert_eq!(tail[2].1["text"], "plain progress line");
    assert_eq!(tail[2].1["kind"], "system");
    assert_eq!(tail[3].1["kind"], "result");
    assert_eq!(tail[3].1["text"], "found 3 items");
    assert_eq!(tail[4], ("complete".to_string(), json!({"success": true})));

    client.close();
}

#[tokio::test]
async fn second_submit_is_rejected_and_stop_ends_run() {
    let server = start_server("echo ready; sleep 30").await;
    let (client, mut rx) = connect(&server).await;

    assert!(client.emit("submit", json!({"prompt": "wait around"})));
    loop {
        let (name, data) = next_event(&mut rx).await;
        if name == "log" && data["text"] == "ready" {
            break;
        }
    }

    assert!(client.emit("submit", json!({"prompt": "another"})));
    let (name, data) = next_event(&mut rx).await;
    assert_eq!(name, "error");
    assert!(
        data["message"].as_str().unwrap().contains("already running"),
        "{data}"
    );

    assert!(client.emit("stop", json!({})));
    let events = until_complete(&mut rx).await;
    assert_eq!(
        events.last().unwrap(),
        &("complete".to_string(), json!({"success": false, "stopped": true}))
    );

    // The session is idle again and accepts a new task.
    assert!(client.emit("stop", json!({})));
    assert!(client.emit("submit", json!({"prompt": "again"})));
    let (name, data) = next_event(&mut rx).await;
    assert_eq!(name, "log");
    assert_eq!(data["text"], "Starting automation with task: again");

    client.close();
}

#[tokio::test]
async fn empty_prompt_is_rejected_to_sender_only() {
    let server = start_server("exit 0").await;
    let (sender, mut sender_rx) = connect(&server).await;
    let (_other, mut other_rx) = connect(&server).await;

    assert!(sender.emit("submit", json!({"prompt": "   "})));
    let (name, data) = next_event(&mut sender_rx).await;
    assert_eq!(name, "error");
    assert!(data["message"].as_str().unwrap().starts_with("Invalid request"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(other_rx.try_recv().is_err());
}

#[tokio::test]
async fn health_reports_connected_clients() {
    let server = start_server("exit 0").await;
    let (_client, _rx) = connect(&server).await;

    // The session is registered just after the handshake completes.
    let status = tokio::time::timeout(WAIT, async {
        loop {
            let status: Value = reqwest::get(format!("{}/api/health", server.url))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["active_clients"] == 1 {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status["status"], "ok");
    assert_eq!(status["active_automations"], 0);

    let clients: Value = reqwest::get(format!("{}/api/clients", server.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clients.as_array().unwrap().len(), 1);
}

/// Minimal channel endpoint that closes a connection when asked to `hangup`.
async fn start_hangup_server() -> (String, Arc<AtomicUsize>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let app = Router::new()
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .route(
            WS_PATH,
            get(move |ws: WebSocketUpgrade| {
                let counter = Arc::clone(&counter);
                async move {
                    ws.on_upgrade(move |mut socket| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        while let Some(Ok(msg)) = socket.recv().await {
                            if let Message::Text(text) = msg {
                                if text.as_str().contains("hangup") {
                                    let _ = socket.send(Message::Close(None)).await;
                                    break;
                                }
                            }
                        }
                    })
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (format!("http://{addr}"), connections)
}

#[tokio::test]
async fn dropped_connection_is_surfaced_then_reestablished() {
    let (url, connections) = start_hangup_server().await;
    let base = Duration::from_millis(500);
    let mut config = ClientConfig::new(&url);
    config.backoff = BackoffPolicy {
        base,
        max: Duration::from_secs(2),
        max_retries: 3,
    };

    let client = ChannelClient::connect(config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    for event in [CONNECT_EVENT, DISCONNECT_EVENT] {
        let tx = tx.clone();
        client.on(event, move |data| {
            let _ = tx.send((event.to_string(), data.clone()));
        });
    }

    client.wait_connected(WAIT).await.unwrap();
    assert_eq!(next_event(&mut rx).await.0, CONNECT_EVENT);

    assert!(client.emit("hangup", json!({})));
    let (name, reason) = next_event(&mut rx).await;
    let dropped_at = Instant::now();
    assert_eq!(name, DISCONNECT_EVENT);
    assert_eq!(reason, "closed by server");
    assert_ne!(client.state(), ConnectionState::Connected);
    assert!(!client.emit("submit", json!({"prompt": "lost"})));

    let (name, _) = next_event(&mut rx).await;
    assert_eq!(name, CONNECT_EVENT);
    // The retry after a drop waits one base delay.
    assert!(dropped_at.elapsed() >= base - Duration::from_millis(50));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.emit("ping", json!({})));

    tokio::time::timeout(WAIT, async {
        while connections.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    client.close();
}
