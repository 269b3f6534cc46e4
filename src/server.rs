use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::registry::SessionRegistry;
use crate::types::{AutomationRequest, ClientInfo, Event, ServerStatus, SubmitPayload, WireMessage};

/// Fixed path of the realtime channel.
pub const WS_PATH: &str = "/ws";
pub const HEALTH_PATH: &str = "/api/health";
pub const CLIENTS_PATH: &str = "/api/clients";
/// How many ports above the configured one to try before giving up.
pub const PORT_FALLBACK_RANGE: u16 = 10;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route(WS_PATH, get(ws_handler))
        .route(HEALTH_PATH, get(health_handler))
        .route(CLIENTS_PATH, get(clients_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

/// Binds `host:port`, falling back to the next free port in range.
pub async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    let mut last_err = None;
    for candidate in port..port.saturating_add(PORT_FALLBACK_RANGE) {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    warn!(requested = port, bound = candidate, "port in use, fell back");
                }
                return Ok(listener);
            }
            Err(e) => last_err = Some(e),
        }
    }
    let err = last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("empty port range"));
    Err(err.context(format!(
        "could not bind {host}:{port}-{}",
        port.saturating_add(PORT_FALLBACK_RANGE - 1)
    )))
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, ws = WS_PATH, "server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(ServerStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        active_clients: state.registry.len().await,
        active_automations: state.registry.active_automations().await,
    })
}

async fn clients_handler(State(state): State<AppState>) -> Json<Vec<ClientInfo>> {
    Json(state.registry.clients().await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let info = ClientInfo {
        client_id: Uuid::new_v4().to_string(),
        connected_at: chrono::Local::now().to_rfc3339(),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        ip_address: Some(addr.ip().to_string()),
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, info))
}

async fn handle_connection(socket: WebSocket, state: AppState, info: ClientInfo) {
    let session = state.registry.attach(info).await;
    let session_id = session.id().to_string();
    info!(session_id = %session_id, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    // Replies to this client only (rejections, protocol errors).
    let (reply_tx, mut reply_rx) = mpsc::channel::<Event>(16);
    let mut events = Box::pin(session.fanout().stream());

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = events.next() => event,
                Some(event) = reply_rx.recv() => event,
                else => break,
            };
            if ws_sender
                .send(Message::Text(event.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "websocket receive error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Some(reply) = handle_frame(&state, &session_id, text.as_str()).await {
                    let _ = reply_tx.send(reply).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.detach(&session_id).await;
    send_task.abort();
    info!(session_id = %session_id, "client disconnected");
}

/// Dispatches one client frame. Returns a reply for the sender, if any.
async fn handle_frame(state: &AppState, session_id: &str, text: &str) -> Option<Event> {
    let frame: WireMessage = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session_id, error = %e, "invalid JSON frame");
            return Some(Event::Error {
                message: "Invalid JSON format".to_string(),
            });
        }
    };
    debug!(session_id, event = %frame.event, "received frame");

    match frame.event.as_str() {
        "submit" => {
            let result = serde_json::from_value::<SubmitPayload>(frame.data)
                .map_err(|e| AgentError::Configuration(e.to_string()))
                .and_then(AutomationRequest::from_submit);
            let result = match result {
                Ok(request) => state.registry.submit(session_id, request).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(handle) => {
                    debug!(session_id, run_id = %handle.id, "submission accepted");
                    None
                }
                Err(e) => {
                    if e.is_rejection() {
                        info!(session_id, error = %e, "submission rejected");
                    } else {
                        warn!(session_id, error = %e, "submission failed");
                    }
                    Some(Event::Error {
                        message: format!("Invalid request: {e}"),
                    })
                }
            }
        }
        "stop" => {
            match state.registry.cancel(session_id).await {
                Ok(true) => info!(session_id, "automation stopped by user"),
                Ok(false) => debug!(session_id, "stop with nothing running"),
                Err(e) => warn!(session_id, error = %e, "stop failed"),
            }
            None
        }
        other => Some(Event::Error {
            message: format!("Unknown event: {other}"),
        }),
    }
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Browser Automation Agent</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 32px; }
  #status.ok { color: #22c55e; }
  #status.down { color: #ef4444; }
  #log { font-family: monospace; font-size: 13px; white-space: pre-wrap; margin-top: 16px; }
  .error { color: #fca5a5; }
  .result { color: #86efac; }
</style>
</head>
<body>
  <h1>Browser Automation Agent</h1>
  <p>Channel: <span id="status">connecting...</span></p>
  <input id="prompt" size="60" placeholder="Tell the agent what to do..." />
  <button onclick="submitTask()">Run</button>
  <button onclick="stopTask()">Stop</button>
  <div id="log"></div>
<script>
  const statusEl = document.getElementById('status');
  const logEl = document.getElementById('log');
  const ws = new WebSocket(`ws://${window.location.host}/ws`);

  function line(cls, text) {
    const div = document.createElement('div');
    div.className = cls;
    div.textContent = text;
    logEl.appendChild(div);
  }

  ws.onopen = () => { statusEl.textContent = 'connected'; statusEl.className = 'ok'; };
  ws.onclose = () => { statusEl.textContent = 'disconnected'; statusEl.className = 'down'; };
  ws.onmessage = (msg) => {
    const { event, data } = JSON.parse(msg.data);
    if (event === 'log') line(data.kind, `[${data.timestamp}] ${data.text}`);
    else if (event === 'screenshot') line('system', `screenshot (${data.data.length} chars)`);
    else if (event === 'error') line('error', data.message);
    else if (event === 'complete') line(data.success ? 'result' : 'error',
      data.stopped ? 'stopped' : (data.success ? 'completed' : 'failed'));
  };

  function submitTask() {
    const prompt = document.getElementById('prompt').value.trim();
    if (prompt) ws.send(JSON.stringify({ event: 'submit', data: { prompt, options: {} } }));
  }
  function stopTask() { ws.send(JSON.stringify({ event: 'stop', data: {} })); }
</script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use serde_json::json;

    fn state() -> AppState {
        AppState::new(Arc::new(SessionRegistry::new(WorkerConfig::default(), 16)))
    }

    async fn attached(state: &AppState, id: &str) {
        state
            .registry
            .attach(ClientInfo {
                client_id: id.to_string(),
                connected_at: chrono::Local::now().to_rfc3339(),
                user_agent: None,
                ip_address: None,
            })
            .await;
    }

    #[tokio::test]
    async fn malformed_frame_gets_invalid_json_reply() {
        let state = state();
        attached(&state, "a").await;
        let reply = handle_frame(&state, "a", "{not json").await;
        assert_eq!(
            reply,
            Some(Event::Error {
                message: "Invalid JSON format".into()
            })
        );
    }

    #[tokio::test]
    async fn bedrock_without_region_is_rejected_without_events() {
        let state = state();
        attached(&state, "a").await;
        let session = state.registry.session("a").await.unwrap();
        let mut rx = session.fanout().subscribe();

        let frame = json!({
            "event": "submit",
            "data": {"prompt": "check prices", "options": {"modelProvider": "bedrock"}}
        });
        let reply = handle_frame(&state, "a", &frame.to_string()).await;

        match reply {
            Some(Event::Error { message }) => assert!(message.contains("awsRegion")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(state.registry.active_automations().await, 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let state = state();
        attached(&state, "a").await;
        let frame = json!({
            "event": "submit",
            "data": {"prompt": "x", "options": {"modelProvider": "mystery"}}
        });
        assert!(matches!(
            handle_frame(&state, "a", &frame.to_string()).await,
            Some(Event::Error { .. })
        ));
    }

    #[tokio::test]
    async fn stop_when_idle_is_silent() {
        let state = state();
        attached(&state, "a").await;
        let reply = handle_frame(&state, "a", r#"{"event":"stop","data":{}}"#).await;
        assert_eq!(reply, None);
        let reply = handle_frame(&state, "a", r#"{"event":"stop"}"#).await;
        assert_eq!(reply, None);
    }
}
