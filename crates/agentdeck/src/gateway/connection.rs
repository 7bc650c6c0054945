//! Upstream connection ownership and lifecycle.
//!
//! One manager owns the single WebSocket to the gateway for the whole
//! process. It authenticates once per connection lifetime, classifies
//! inbound frames (responses to the correlator, events to the bus),
//! and drives an unbounded jittered-backoff reconnect loop. Connection
//! loss is never fatal; it degrades health reporting and fails pending
//! requests.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::bus::{EventBus, EventSource};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::correlator::RequestCorrelator;
use crate::gateway::identity::DeviceIdentity;
use crate::gateway::protocol::{ClientFrame, ServerFrame, WireEvent};
use crate::replay::{ReplayRegistry, StreamMeta};

/// Size of the outbound frame queue between the correlator and the
/// transport pump.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// How often the pump garbage-collects abandoned pending requests.
const GC_INTERVAL: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Lifecycle of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Read-only view of connection health, polled by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct HealthInner {
    state: ConnectionState,
    last_error: Option<String>,
}

/// Shared health cell; written only by the connection manager.
#[derive(Debug, Clone)]
pub struct SharedHealth(Arc<RwLock<HealthInner>>);

impl SharedHealth {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(HealthInner {
            state: ConnectionState::Disconnected,
            last_error: None,
        })))
    }

    pub fn state(&self) -> ConnectionState {
        self.0.read().unwrap().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.0.read().unwrap();
        HealthSnapshot {
            state: inner.state,
            last_error: inner.last_error.clone(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.0.write().unwrap().state = state;
    }

    fn set_error(&self, error: impl Into<String>) {
        self.0.write().unwrap().last_error = Some(error.into());
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Deterministic delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        self.base.saturating_mul(factor as u32).min(self.cap)
    }

    /// Next delay, advancing the attempt counter and adding jitter of
    /// up to a quarter of the deterministic delay.
    pub fn next_delay(&mut self) -> Duration {
        use rand::Rng;
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ceiling = (delay.as_millis() / 4) as u64;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ceiling)
        };
        delay + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Cloneable handle other components use to reach the gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    correlator: Arc<RequestCorrelator>,
    health: SharedHealth,
    start: Arc<Notify>,
    started: Arc<AtomicBool>,
}

impl GatewayHandle {
    /// Start connecting. Idempotent: calling while already
    /// connecting/connected is a no-op returning the current state.
    pub fn connect(&self) -> ConnectionState {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.start.notify_one();
        }
        self.health.state()
    }

    pub fn state(&self) -> ConnectionState {
        self.health.state()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Issue a call and suspend until resolution, rejection, or timeout.
    pub async fn call(&self, method: &str, params: Value) -> GatewayResult<Value> {
        self.ensure_connected()?;
        self.correlator.call(method, params).await
    }

    /// Like [`call`](Self::call) with a caller-supplied idempotency token.
    pub async fn call_with_token(
        &self,
        method: &str,
        params: Value,
        idempotency_token: Option<String>,
    ) -> GatewayResult<Value> {
        self.ensure_connected()?;
        self.correlator
            .call_with_token(method, params, idempotency_token)
            .await
    }

    /// Fire-and-forget call; the outcome is tracked and logged but not
    /// surfaced. Used for deliberately non-fatal deliveries such as
    /// terminal keystrokes.
    pub fn call_detached(&self, method: &str, params: Value) {
        if let Err(err) = self.ensure_connected() {
            warn!("dropping detached call {}: {}", method, err);
            return;
        }
        Arc::clone(&self.correlator).call_detached(method, params);
    }

    fn ensure_connected(&self) -> GatewayResult<()> {
        let state = self.health.state();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(GatewayError::ConnectionLost(format!(
                "gateway is {state}"
            )))
        }
    }
}

/// Owns the upstream transport. Exactly one exists per process; it is
/// constructed at startup and runs until shutdown.
pub struct ConnectionManager {
    url: String,
    identity: DeviceIdentity,
    bus: Arc<EventBus>,
    replay: Arc<ReplayRegistry>,
    correlator: Arc<RequestCorrelator>,
    health: SharedHealth,
    outbound_rx: mpsc::Receiver<ClientFrame>,
    start: Arc<Notify>,
    auth_timeout: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl ConnectionManager {
    pub fn new(
        config: &GatewayConfig,
        identity: DeviceIdentity,
        bus: Arc<EventBus>,
        replay: Arc<ReplayRegistry>,
    ) -> (Self, GatewayHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let correlator = Arc::new(RequestCorrelator::new(
            outbound_tx,
            Duration::from_secs(config.request_timeout_secs),
        ));
        let health = SharedHealth::new();
        let start = Arc::new(Notify::new());

        let handle = GatewayHandle {
            correlator: Arc::clone(&correlator),
            health: health.clone(),
            start: Arc::clone(&start),
            started: Arc::new(AtomicBool::new(false)),
        };
        let manager = Self {
            url: config.url.clone(),
            identity,
            bus,
            replay,
            correlator,
            health,
            outbound_rx,
            start,
            auth_timeout: Duration::from_secs(config.auth_timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        };
        (manager, handle)
    }

    /// Background service loop. Runs until the process shuts down;
    /// retries are unlimited.
    pub async fn run(mut self) {
        self.start.notified().await;
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_cap);

        loop {
            let reason = match self.run_once(&mut backoff).await {
                Ok(()) => "connection closed".to_string(),
                Err(err) => err.to_string(),
            };
            warn!("gateway connection ended: {}", reason);

            self.health.set_error(reason.clone());
            self.health.set_state(ConnectionState::Reconnecting);
            self.correlator.fail_all(&reason);
            self.publish_status();

            let delay = backoff.next_delay();
            info!("reconnecting to gateway in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once(&mut self, backoff: &mut Backoff) -> GatewayResult<()> {
        // Frames queued while we were down belong to requests that were
        // already rejected; never replay them on a fresh connection.
        while self.outbound_rx.try_recv().is_ok() {}

        self.set_state(ConnectionState::Connecting);
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| GatewayError::ConnectionLost(format!("dialing {}: {e}", self.url)))?;
        let (mut sink, mut stream) = ws.split();

        self.set_state(ConnectionState::Authenticating);
        self.authenticate(&mut sink, &mut stream).await?;

        self.set_state(ConnectionState::Connected);
        backoff.reset();
        info!("gateway connected");

        let bus = Arc::clone(&self.bus);
        let replay = Arc::clone(&self.replay);
        let correlator = Arc::clone(&self.correlator);
        let outbound_rx = &mut self.outbound_rx;
        let mut gc = tokio::time::interval(GC_INTERVAL);

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        // All senders gone: the process is shutting down.
                        return Ok(());
                    };
                    let json = serde_json::to_string(&frame).map_err(|e| {
                        GatewayError::ConnectionLost(format!("serializing frame: {e}"))
                    })?;
                    sink.send(Message::Text(json.into()))
                        .await
                        .map_err(|e| GatewayError::ConnectionLost(e.to_string()))?;
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::dispatch(&bus, &replay, &correlator, text.as_str());
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
                            debug!("ignoring non-text gateway frame");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(GatewayError::ConnectionLost(
                                "gateway closed the connection".to_string(),
                            ));
                        }
                        Some(Err(e)) => {
                            return Err(GatewayError::ConnectionLost(e.to_string()));
                        }
                    }
                }
                _ = gc.tick() => {
                    correlator.expire_stale();
                }
            }
        }
    }

    /// Sign the server-issued challenge and wait for the verdict, both
    /// within the auth timeout.
    async fn authenticate(&self, sink: &mut WsSink, stream: &mut WsStream) -> GatewayResult<()> {
        let nonce = tokio::time::timeout(self.auth_timeout, wait_for_challenge(stream))
            .await
            .map_err(|_| {
                GatewayError::AuthenticationFailed("challenge timed out".to_string())
            })??;

        let frame = ClientFrame::Auth {
            public_key: self.identity.public_key_b64(),
            signature: self.identity.sign_challenge(&nonce),
        };
        let json = serde_json::to_string(&frame)
            .map_err(|e| GatewayError::AuthenticationFailed(e.to_string()))?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| GatewayError::ConnectionLost(e.to_string()))?;

        tokio::time::timeout(self.auth_timeout, wait_for_auth_result(stream))
            .await
            .map_err(|_| {
                GatewayError::AuthenticationFailed("auth verdict timed out".to_string())
            })?
    }

    /// Classify an inbound frame: responses go to the correlator,
    /// events to the bus (via the replay registry for pty streams).
    fn dispatch(
        bus: &Arc<EventBus>,
        replay: &ReplayRegistry,
        correlator: &RequestCorrelator,
        text: &str,
    ) {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Response { id, result, error }) => {
                correlator.resolve_response(id, result, error);
            }
            Ok(ServerFrame::Event { event }) => {
                Self::route_event(bus, replay, event);
            }
            Ok(other) => {
                debug!("unexpected gateway frame after handshake: {:?}", other);
            }
            Err(e) => {
                let display: String = text.chars().take(200).collect();
                warn!("failed to parse gateway frame: {e}, line: {display}");
            }
        }
    }

    /// Terminal output events are appended to their replay buffer
    /// (which republishes them); everything else goes straight to the
    /// bus.
    pub(crate) fn route_event(bus: &Arc<EventBus>, replay: &ReplayRegistry, event: WireEvent) {
        if event.event_type != "pty" {
            bus.publish(event.into_bus_event(bus));
            return;
        }

        let Some(stream_key) = event.payload.get("stream").and_then(Value::as_str) else {
            warn!("pty event without a stream key, publishing as-is");
            bus.publish(event.into_bus_event(bus));
            return;
        };
        let meta = StreamMeta {
            label: event
                .payload
                .get("label")
                .and_then(Value::as_str)
                .map(String::from),
            project_id: event.project_id.clone(),
            session_id: event.session_id.clone(),
        };

        if event.payload.get("closed").and_then(Value::as_bool) == Some(true) {
            replay.close(stream_key, &meta);
            return;
        }

        match event.payload.get("data").and_then(Value::as_str) {
            Some(encoded) => match BASE64.decode(encoded) {
                Ok(bytes) => replay.append(stream_key, &bytes, &meta),
                Err(e) => warn!("undecodable pty chunk for stream {stream_key}: {e}"),
            },
            None => debug!("pty event for stream {stream_key} carried no data"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.health.set_state(state);
        self.publish_status();
    }

    /// Synthetic status event so subscribers can reflect degraded
    /// state without the bus being torn down.
    fn publish_status(&self) {
        let snapshot = self.health.snapshot();
        let event = self.bus.make_event(
            EventSource::System,
            "status",
            json!({
                "state": snapshot.state,
                "error": snapshot.last_error,
            }),
        );
        self.bus.publish(event);
    }
}

async fn wait_for_challenge(stream: &mut WsStream) -> GatewayResult<String> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::parse(text.as_str()) {
                Ok(ServerFrame::Challenge { nonce }) => return Ok(nonce),
                Ok(other) => debug!("ignoring pre-auth frame: {:?}", other),
                Err(e) => warn!("unparseable pre-auth frame: {e}"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(GatewayError::ConnectionLost(e.to_string())),
            None => {
                return Err(GatewayError::ConnectionLost(
                    "gateway closed during handshake".to_string(),
                ));
            }
        }
    }
}

async fn wait_for_auth_result(stream: &mut WsStream) -> GatewayResult<()> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::parse(text.as_str()) {
                Ok(ServerFrame::AuthResult { ok: true, .. }) => return Ok(()),
                Ok(ServerFrame::AuthResult { ok: false, message }) => {
                    return Err(GatewayError::AuthenticationFailed(
                        message.unwrap_or_else(|| "gateway rejected credentials".to_string()),
                    ));
                }
                Ok(other) => debug!("ignoring pre-auth frame: {:?}", other),
                Err(e) => warn!("unparseable pre-auth frame: {e}"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(GatewayError::ConnectionLost(e.to_string())),
            None => {
                return Err(GatewayError::ConnectionLost(
                    "gateway closed during handshake".to_string(),
                ));
            }
        }
    }
}
