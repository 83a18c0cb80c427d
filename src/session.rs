//! WebSocket-backed connection session for the WARP terminal-control service.
//!
//! One `WarpSession` owns one logical connection: connect with a bearer
//! token, run a single background listener task that routes inbound frames
//! to named events, and tear down idempotently from any calling context,
//! including the process exit path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::ClientError;
use crate::events::{Callback, EventRegistry};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::shutdown;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const DISCONNECTING: u8 = 3;

/// Connection lifecycle state. Transitions are monotonic:
/// Disconnected → Connecting → Connected → Disconnecting → Disconnected.
/// A failed connect returns to Disconnected without ever reaching Connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            CONNECTING => Self::Connecting,
            CONNECTED => Self::Connected,
            DISCONNECTING => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session's connection status.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub authenticated: bool,
    pub last_ping: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One logical connection to the remote terminal-control endpoint.
///
/// The connection handle and the callback registry are exclusively owned by
/// the session; all interaction goes through `connect` / `disconnect` /
/// `on` / `send`. Sessions are single-use: after teardown they cannot be
/// reconnected.
pub struct WarpSession {
    config: SessionConfig,
    token: String,
    state: AtomicU8,
    torn_down: AtomicBool,
    ever_connected: AtomicBool,
    disconnected_emitted: AtomicBool,
    authenticated: AtomicBool,
    registry: EventRegistry,
    metrics: SessionMetrics,
    stop_tx: watch::Sender<bool>,
    listener: AsyncMutex<Option<JoinHandle<()>>>,
    outbound: AsyncMutex<Option<mpsc::Sender<Message>>>,
    last_ping: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl WarpSession {
    /// Create a session for `endpoint` with default timeouts.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
        let config = SessionConfig {
            endpoint: endpoint.into(),
            ..SessionConfig::default()
        };
        Self::with_config(config, token)
    }

    /// Create a session from a full configuration. The token is opaque and
    /// is never logged or exposed through `Debug` / `status`.
    pub fn with_config(config: SessionConfig, token: impl Into<String>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            config,
            token: token.into(),
            state: AtomicU8::new(DISCONNECTED),
            torn_down: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            disconnected_emitted: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            registry: EventRegistry::new(),
            metrics: SessionMetrics::default(),
            stop_tx,
            listener: AsyncMutex::new(None),
            outbound: AsyncMutex::new(None),
            last_ping: Mutex::new(None),
            last_error: Mutex::new(None),
        });
        shutdown::track(&session);
        session
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            authenticated: self.authenticated.load(Ordering::SeqCst),
            last_ping: self.last_ping.lock().map(|g| *g).unwrap_or(None),
            error_message: self.last_error.lock().map(|g| g.clone()).unwrap_or(None),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register `callback` for `event`. Callbacks for the same event fire
    /// in registration order; duplicates are allowed. Silently ignored once
    /// the session is disconnecting or torn down.
    pub fn on<F>(&self, event: &str, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if self.state() == ConnectionState::Disconnecting || self.torn_down.load(Ordering::SeqCst)
        {
            debug!(%event, "callback registration ignored during teardown");
            return;
        }
        let callback: Callback = Arc::new(callback);
        self.registry.register(event, callback);
    }

    /// Connect and authenticate against the configured endpoint.
    ///
    /// On success the session is Connected and exactly one listener task is
    /// running. On failure the state returns to Disconnected and the error
    /// says whether the endpoint was unreachable or rejected the token.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(ClientError::SessionClosed);
        }
        let endpoint = &self.config.endpoint;
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(ClientError::InvalidEndpoint(endpoint.clone()));
        }

        self.state
            .compare_exchange(DISCONNECTED, CONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|current| match ConnectionState::from_u8(current) {
                ConnectionState::Disconnecting => ClientError::SessionClosed,
                _ => ClientError::AlreadyConnected,
            })?;

        let ws = match self.handshake().await {
            Ok(ws) => ws,
            Err(e) => {
                // Roll back unless a concurrent disconnect already claimed
                // the teardown.
                let _ = self.state.compare_exchange(
                    CONNECTING,
                    DISCONNECTED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                self.set_last_error(e.to_string());
                return Err(e);
            }
        };

        // Commit under the listener lock so a racing disconnect either sees
        // the stored handle or prevents the spawn entirely.
        {
            let mut listener_guard = self.listener.lock().await;
            if self
                .state
                .compare_exchange(CONNECTING, CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // disconnect() won the race mid-handshake.
                return Err(ClientError::SessionClosed);
            }

            let (out_tx, out_rx) = mpsc::channel(32);
            let stop_rx = self.stop_tx.subscribe();
            let handle = tokio::spawn(listener_loop(
                Arc::downgrade(self),
                ws,
                out_rx,
                stop_rx,
            ));
            *self.outbound.lock().await = Some(out_tx);
            *listener_guard = Some(handle);
        }

        self.ever_connected.store(true, Ordering::SeqCst);
        self.authenticated.store(true, Ordering::SeqCst);
        info!(endpoint = %self.config.endpoint, "connected");
        self.dispatch("connected", &Value::Null);
        Ok(())
    }

    /// Send a JSON message over the live connection.
    pub async fn send(&self, message: &Value) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self.outbound.lock().await.clone();
        let tx = tx.ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(message.to_string()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Tear the connection down. Idempotent: safe from any state, from two
    /// contexts at once, concurrently with an in-flight `connect`, and
    /// during process exit. Never returns an error.
    ///
    /// The state moves to Disconnecting before any await, the listener is
    /// signalled and waited on up to the configured shutdown timeout, then
    /// the connection handle is released regardless. The `"disconnected"`
    /// event fires exactly once per session, before this returns.
    pub async fn disconnect(&self) {
        let claimed = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            if s == CONNECTING || s == CONNECTED {
                Some(DISCONNECTING)
            } else {
                None
            }
        });

        let Ok(previous) = claimed else {
            // Already Disconnecting (another teardown in flight) or
            // Disconnected. A never-connected session still becomes closed
            // to late registrations.
            if claimed == Err(DISCONNECTED) && !self.torn_down.swap(true, Ordering::SeqCst) {
                self.registry.close();
            }
            return;
        };
        debug!(
            from = %ConnectionState::from_u8(previous),
            "teardown starting"
        );

        let _ = self.stop_tx.send(true);

        // The listener lock serializes against a connect commit in flight,
        // so the handle taken here is the one that commit stored (if any).
        let handle = self.listener.lock().await.take();

        // Dropping the sender also ends the outbound half of the listener.
        self.outbound.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.config.shutdown_timeout(), &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.shutdown_timeout_ms,
                        "listener did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        self.authenticated.store(false, Ordering::SeqCst);

        if self.ever_connected.load(Ordering::SeqCst) {
            self.emit_disconnected();
        }

        self.registry.close();
        self.torn_down.store(true, Ordering::SeqCst);
        self.state.store(DISCONNECTED, Ordering::SeqCst);
        info!("session disconnected");
    }

    /// Emit the `"disconnected"` event at most once per session, whether
    /// the close came from the peer or from our own teardown.
    fn emit_disconnected(&self) {
        if !self.disconnected_emitted.swap(true, Ordering::SeqCst) {
            self.dispatch("disconnected", &Value::Null);
        }
    }

    fn dispatch(&self, event: &str, data: &Value) {
        let outcome = self.registry.emit(event, data);
        self.metrics.record_dispatch(outcome.invoked, outcome.failed);
    }

    fn set_last_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    async fn handshake(&self) -> Result<WsStream, ClientError> {
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidEndpoint(e.to_string()))?;
        let bearer = format!("Bearer {}", self.token);
        let header = HeaderValue::from_str(&bearer).map_err(|_| {
            ClientError::InvalidEndpoint("token contains characters invalid in a header".into())
        })?;
        request.headers_mut().insert("Authorization", header);

        let attempt =
            tokio::time::timeout(self.config.connect_timeout(), connect_async(request)).await;
        match attempt {
            Err(_) => Err(ClientError::Unreachable(format!(
                "handshake timed out after {}ms",
                self.config.connect_timeout_ms
            ))),
            Ok(Err(WsError::Http(response))) => {
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    Err(ClientError::AuthRejected {
                        status: status.as_u16(),
                    })
                } else {
                    Err(ClientError::Unreachable(format!(
                        "endpoint returned HTTP {status}"
                    )))
                }
            }
            Ok(Err(e)) => Err(ClientError::Unreachable(e.to_string())),
            Ok(Ok((ws, _response))) => Ok(ws),
        }
    }

    /// Resolve an inbound JSON frame to an event and dispatch it. Returns
    /// a reply frame when the protocol demands one (ping → pong).
    fn route_message(&self, data: Value) -> Option<Message> {
        let msg_type = data.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "ping" => {
                if let Ok(mut last) = self.last_ping.lock() {
                    *last = Some(Utc::now());
                }
                Some(Message::Text(json!({"type": "pong"}).to_string()))
            }
            "command_response" | "agent_message" | "file_update" => {
                self.dispatch(msg_type, &data);
                None
            }
            _ => {
                self.dispatch("websocket_message", &data);
                None
            }
        }
    }

    fn connection_closed_by_peer(&self) {
        info!("connection closed by endpoint");
        self.authenticated.store(false, Ordering::SeqCst);
        self.finish_remote_teardown();
    }

    fn connection_errored(&self, reason: String) {
        self.set_last_error(reason.clone());
        self.authenticated.store(false, Ordering::SeqCst);
        self.dispatch("connection_error", &json!({ "error": reason }));
        self.finish_remote_teardown();
    }

    /// Complete the state machine when the listener observes the connection
    /// ending on its own: the same Connected → Disconnecting → Disconnected
    /// path as `disconnect`, so `state()` reflects the dead connection. If
    /// an explicit teardown already claimed Disconnecting it reaps instead,
    /// and the emit guard keeps `"disconnected"` single either way.
    fn finish_remote_teardown(&self) {
        if self
            .state
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Runs on the listener task itself, which is exiting; its own
            // handle can be detached. try_lock fails only while another
            // teardown path holds the lock, and that path takes the handle.
            if let Ok(mut listener) = self.listener.try_lock() {
                listener.take();
            }
            if let Ok(mut outbound) = self.outbound.try_lock() {
                outbound.take();
            }
            self.emit_disconnected();
            self.registry.close();
            self.torn_down.store(true, Ordering::SeqCst);
            self.state.store(DISCONNECTED, Ordering::SeqCst);
        } else {
            self.emit_disconnected();
        }
    }
}

impl fmt::Debug for WarpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarpSession")
            .field("endpoint", &self.config.endpoint)
            .field("token", &"<redacted>")
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for WarpSession {
    fn drop(&mut self) {
        // Last-resort cleanup for sessions dropped without disconnect.
        if let Ok(mut guard) = self.listener.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// The single background listener for a connected session.
///
/// Owns both halves of the WebSocket. Cancellation is cooperative: the stop
/// signal (or closing of the outbound channel) ends the loop; `disconnect`
/// bounds how long it waits for that to happen.
async fn listener_loop(
    session: Weak<WarpSession>,
    ws: WsStream,
    mut out_rx: mpsc::Receiver<Message>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        // The stop signal may have fired before this task first polled it.
        if *stop_rx.borrow() {
            let _ = ws_tx.send(Message::Close(None)).await;
            break;
        }

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
            outgoing = out_rx.recv() => {
                let Some(msg) = outgoing else { break };
                let Some(session) = session.upgrade() else { break };
                if ws_tx.send(msg).await.is_err() {
                    session.connection_errored("send failed, connection lost".to_string());
                    break;
                }
                session.metrics.record_sent();
            }
            inbound = ws_rx.next() => {
                let Some(session) = session.upgrade() else { break };
                match inbound {
                    None => {
                        session.connection_closed_by_peer();
                        break;
                    }
                    Some(Err(e)) => {
                        session.connection_errored(e.to_string());
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        session.metrics.record_received(text.len());
                        match serde_json::from_str::<Value>(&text) {
                            Ok(data) => {
                                if let Some(reply) = session.route_message(data) {
                                    if ws_tx.send(reply).await.is_ok() {
                                        session.metrics.record_sent();
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping frame with invalid JSON"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        session.connection_closed_by_peer();
                        break;
                    }
                    Some(Ok(_)) => {} // binary and pong frames are not part of the protocol
                }
            }
        }
    }
    debug!("listener task exiting");
}
