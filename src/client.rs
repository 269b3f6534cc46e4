//! Consumer side of the realtime channel.
//!
//! A background task owns the connection and walks
//! `Connecting -> Connected -> Disconnected -> Connecting ...`, sleeping a
//! single exponential backoff delay between attempts. After
//! `max_retries` consecutive failed attempts it parks in `GaveUp` until
//! [`ChannelClient::reset`] is called.
//!
//! Besides server events, listeners receive two local events: `connect` and
//! `disconnect`, so a dropped connection is never silent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::server::{HEALTH_PATH, WS_PATH};
use crate::types::WireMessage;

pub const CONNECT_EVENT: &str = "connect";
pub const DISCONNECT_EVENT: &str = "disconnect";
const OUTBOUND_BUFFER: usize = 64;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^failures, max)`.
    pub fn delay(&self, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Consecutive-failure counter driving [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Records a failed attempt. `None` once retries are exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        (self.failures <= self.policy.max_retries).then(|| self.policy.delay(self.failures))
    }

    /// Delay after an established connection drops.
    pub fn after_disconnect(&self) -> Duration {
        self.policy.delay(self.failures)
    }
}

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_event: HashMap<String, Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    fn add(&mut self, event: &str, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.by_event
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Removes one listener, or every listener for `event` when `id` is `None`.
    fn remove(&mut self, event: &str, id: Option<ListenerId>) -> usize {
        match id {
            None => self.by_event.remove(event).map_or(0, |list| list.len()),
            Some(id) => {
                let Some(list) = self.by_event.get_mut(event) else {
                    return 0;
                };
                let before = list.len();
                list.retain(|(existing, _)| *existing != id);
                let removed = before - list.len();
                if list.is_empty() {
                    self.by_event.remove(event);
                }
                removed
            }
        }
    }

    fn snapshot(&self, event: &str) -> Vec<Listener> {
        self.by_event
            .get(event)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://host:port` of the server.
    pub base_url: String,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, HEALTH_PATH)
    }

    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}{WS_PATH}")
    }
}

struct Shared {
    config: ClientConfig,
    http: reqwest::Client,
    listeners: Mutex<Listeners>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    state_tx: watch::Sender<ConnectionState>,
    reset: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "channel state");
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn dispatch(&self, event: &str, data: &Value) {
        // Called outside the lock so listeners may register or unregister.
        let listeners = self.listeners().snapshot(event);
        for listener in listeners {
            listener(data);
        }
    }
}

pub struct ChannelClient {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl ChannelClient {
    /// Starts connecting immediately.
    pub fn connect(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            config,
            http: reqwest::Client::new(),
            listeners: Mutex::new(Listeners::default()),
            outbound: Mutex::new(None),
            state_tx,
            reset: Notify::new(),
        });
        let task = tokio::spawn(connection_loop(Arc::clone(&shared)));
        Self { shared, task }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Waits until connected. Fails if the client gives up or `timeout` passes.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::GaveUp)),
        )
        .await;
        match reached {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(AgentError::ChannelDisconnect("gave up reconnecting".into())),
            Err(_) => Err(AgentError::ChannelDisconnect("timed out connecting".into())),
        }
    }

    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.listeners().add(event, Arc::new(listener))
    }

    /// Removes `id`, or every listener for `event` when `id` is `None`.
    /// Returns how many were removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        self.shared.listeners().remove(event, id)
    }

    /// Sends `{event, data}`. Returns `false` without queuing when the
    /// channel is not connected; the message is then not delivered.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let Ok(text) = serde_json::to_string(&WireMessage::new(event, data)) else {
            return false;
        };
        match self.shared.outbound().as_ref() {
            Some(tx) => tx.try_send(text).is_ok(),
            None => false,
        }
    }

    /// Re-arms a client that gave up. No effect in any other state.
    pub fn reset(&self) -> bool {
        if self.state() != ConnectionState::GaveUp {
            return false;
        }
        self.shared.reset.notify_one();
        true
    }

    pub fn close(&self) {
        self.task.abort();
        self.shared.outbound().take();
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connection_loop(shared: Arc<Shared>) {
    let mut backoff = Backoff::new(shared.config.backoff.clone());

    loop {
        shared.set_state(ConnectionState::Connecting);
        match establish(&shared).await {
            Ok(ws) => {
                backoff.on_success();
                let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
                *shared.outbound() = Some(tx);
                shared.set_state(ConnectionState::Connected);
                info!(url = %shared.config.ws_url(), "channel connected");
                shared.dispatch(CONNECT_EVENT, &Value::Null);

                let reason = run_connection(ws, rx, &shared).await;

                shared.outbound().take();
                shared.set_state(ConnectionState::Disconnected);
                warn!(%reason, "channel disconnected");
                shared.dispatch(DISCONNECT_EVENT, &Value::String(reason));
                tokio::time::sleep(backoff.after_disconnect()).await;
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                match backoff.on_failure() {
                    Some(delay) => {
                        warn!(error = %e, failures = backoff.failures(), delay_ms = delay.as_millis() as u64, "channel connect failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(error = %e, failures = backoff.failures(), "channel connect failed, giving up");
                        shared.set_state(ConnectionState::GaveUp);
                        shared.reset.notified().await;
                        info!("channel reset, reconnecting");
                        backoff.on_success();
                    }
                }
            }
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Health probe, then the websocket handshake.
async fn establish(shared: &Shared) -> Result<WsStream> {
    let config = &shared.config;
    shared
        .http
        .get(config.health_url())
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| AgentError::ChannelDisconnect(format!("health probe failed: {e}")))?;

    let (ws, _) = tokio_tungstenite::connect_async(config.ws_url())
        .await
        .map_err(|e| AgentError::ChannelDisconnect(format!("handshake failed: {e}")))?;
    Ok(ws)
}

/// Pumps frames both ways until the connection ends. Returns why it ended.
async fn run_connection(
    ws: WsStream,
    mut outbound: mpsc::Receiver<String>,
    shared: &Shared,
) -> String {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WireMessage>(text.as_str()) {
                        Ok(frame) => shared.dispatch(&frame.event, &frame.data),
                        Err(e) => debug!(error = %e, "ignoring malformed frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("receive error: {e}"),
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return format!("send error: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_retries: 5,
        }
    }

    #[test]
    fn delay_doubles_up_to_max() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(4), Duration::from_millis(1000));
        assert_eq!(p.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn failures_follow_formula_and_reset_after_success() {
        let mut backoff = Backoff::new(policy());
        assert_eq!(backoff.on_failure(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.on_failure(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.on_failure(), Some(Duration::from_millis(800)));

        backoff.on_success();
        assert_eq!(backoff.after_disconnect(), Duration::from_millis(100));
        assert_eq!(backoff.on_failure(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn retries_are_bounded() {
        let mut backoff = Backoff::new(BackoffPolicy {
            max_retries: 2,
            ..policy()
        });
        assert!(backoff.on_failure().is_some());
        assert!(backoff.on_failure().is_some());
        assert_eq!(backoff.on_failure(), None);
    }

    #[test]
    fn listeners_are_removed_individually_or_by_event() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut listeners = Listeners::default();
        let counter = |hits: &Arc<AtomicUsize>| -> Listener {
            let hits = Arc::clone(hits);
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let first = listeners.add("log", counter(&hits));
        let _second = listeners.add("log", counter(&hits));
        listeners.add("complete", counter(&hits));

        assert_eq!(listeners.snapshot("log").len(), 2);
        assert_eq!(listeners.remove("log", Some(first)), 1);
        assert_eq!(listeners.remove("log", Some(first)), 0);
        for l in listeners.snapshot("log") {
            l(&Value::Null);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(listeners.remove("log", None), 1);
        assert!(listeners.snapshot("log").is_empty());
        assert_eq!(listeners.snapshot("complete").len(), 1);
    }

    #[test]
    fn urls_are_derived_from_base() {
        let config = ClientConfig::new("http://127.0.0.1:3001/");
        assert_eq!(config.health_url(), "http://127.0.0.1:3001/api/health");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:3001/ws");
        assert_eq!(
            ClientConfig::new("https://agent.example").ws_url(),
            "wss://agent.example/ws"
        );
    }

    #[tokio::test]
    async fn unreachable_server_gives_up_and_can_be_reset() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = ClientConfig::new(format!("http://127.0.0.1:{port}"));
        config.backoff = BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            max_retries: 2,
        };

        let client = ChannelClient::connect(config);
        assert!(!client.emit("submit", serde_json::json!({})));

        let err = client.wait_connected(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, AgentError::ChannelDisconnect(_)));
        assert_eq!(client.state(), ConnectionState::GaveUp);
        assert!(!client.emit("stop", serde_json::json!({})));

        let mut states = client.watch_state();
        states.mark_unchanged();
        assert!(client.reset());
        tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|s| *s != ConnectionState::GaveUp),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(client.wait_connected(Duration::from_secs(10)).await.is_err());

        client.close();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
