//! Realtime websocket session client.
//!
//! The client spawns a background worker that owns the websocket and the
//! outbox, drives the reconnect state machine, and keeps resending aged
//! outbox entries until the server acknowledges them. Handles communicate
//! with the worker over an in-memory command channel, so submitting never
//! blocks on the network.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthStore;
use crate::dispatch::{ClientEvent, Dispatcher};
use crate::realtime::outbox::{epoch_ms, Outbox, PendingMessage};
use crate::realtime::proto::{self, FrameError};
use crate::retry::with_timeout;

/// Production websocket endpoint for the realtime channel.
pub const REALTIME_ENDPOINT: &str = "wss://api.courierchat.io/websocket/connect";
/// Local development websocket endpoint for the realtime channel.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:8080/websocket/connect";

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    /// Watchdog for a single connect attempt; an attempt still in flight
    /// when this elapses is aborted and immediately restarted.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
    /// Period of the outbox flush timer.
    pub const FLUSH_INTERVAL: Duration = Duration::from_millis(10_000);
    /// Minimum age before an unacknowledged entry is resent.
    pub const FLUSH_GRACE: Duration = Duration::from_millis(10_000);
}

/// Session timing knobs. Defaults match the production protocol contract;
/// tests compress them.
#[derive(Clone, Debug)]
pub struct RealtimeOptions {
    pub connect_timeout: Duration,
    pub flush_interval: Duration,
    pub flush_grace: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RealtimeDefaults::CONNECT_TIMEOUT,
            flush_interval: RealtimeDefaults::FLUSH_INTERVAL,
            flush_grace: RealtimeDefaults::FLUSH_GRACE,
        }
    }
}

/// Connection lifecycle state owned by the session worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Errors surfaced by the realtime session handle.
///
/// Connect and send failures never appear here — the worker absorbs them
/// and reconnects; only local misuse is reported to the caller.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Access token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    /// Outbound frame construction error.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The session worker has stopped; all handles were dropped.
    #[error("session worker is no longer running")]
    SessionClosed,
}

/// Entry point for establishing realtime sessions.
#[derive(Clone)]
pub struct RealtimeClient {
    auth: Arc<dyn AuthStore>,
    local: bool,
    endpoint_override: Option<String>,
    options: RealtimeOptions,
}

impl RealtimeClient {
    /// Creates a realtime client for production mode.
    pub fn new(auth: Arc<dyn AuthStore>) -> Self {
        Self {
            auth,
            local: false,
            endpoint_override: None,
            options: RealtimeOptions::default(),
        }
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit websocket endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Overrides the session timing options.
    pub fn with_options(mut self, options: RealtimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the session worker and returns a handle to it.
    ///
    /// The connection is established in the background and re-established
    /// after every drop, indefinitely; there is no ready gate and no give-up
    /// signal. Messages submitted before the first connect are queued. Must
    /// be called from within a tokio runtime.
    pub fn connect(&self, dispatcher: Arc<dyn Dispatcher>) -> RealtimeSession {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let endpoint = self.endpoint().to_string();
        let options = self.options.clone();
        let auth = Arc::clone(&self.auth);

        tokio::spawn(async move {
            session_worker(endpoint, options, auth, dispatcher, cmd_rx, state_tx).await;
        });

        RealtimeSession { cmd_tx, state_rx }
    }

    fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_REALTIME_ENDPOINT
        } else {
            REALTIME_ENDPOINT
        }
    }
}

enum Command {
    Submit(PendingMessage),
    PendingCount(oneshot::Sender<usize>),
}

/// Cloneable handle to a running session worker.
///
/// The worker shuts down (closing the socket) once every handle clone has
/// been dropped.
#[derive(Clone, Debug)]
pub struct RealtimeSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl RealtimeSession {
    /// Queues an outbound message and returns its correlation id.
    ///
    /// The payload must be a JSON object; a fresh correlation id and the
    /// current timestamp are injected before serialization. The message is
    /// tracked in the outbox until the server acknowledges it, and is sent
    /// immediately when the session is currently connected.
    pub fn submit(&self, payload: Value) -> Result<String, RealtimeError> {
        let correlation_id = Uuid::new_v4().to_string();
        let created_at_ms = epoch_ms();
        let payload = proto::outbound_frame(payload, &correlation_id, created_at_ms)?;

        let message = PendingMessage {
            correlation_id: correlation_id.clone(),
            payload,
            created_at_ms,
        };
        self.cmd_tx
            .send(Command::Submit(message))
            .map_err(|_| RealtimeError::SessionClosed)?;
        Ok(correlation_id)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel following connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Number of messages still awaiting acknowledgment.
    pub async fn pending_count(&self) -> Result<usize, RealtimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PendingCount(reply_tx))
            .map_err(|_| RealtimeError::SessionClosed)?;
        reply_rx.await.map_err(|_| RealtimeError::SessionClosed)
    }
}

enum SessionOutcome {
    Reconnect,
    Shutdown,
}

async fn session_worker(
    endpoint: String,
    options: RealtimeOptions,
    auth: Arc<dyn AuthStore>,
    dispatcher: Arc<dyn Dispatcher>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut outbox = Outbox::new();

    loop {
        state_tx.send_replace(ConnectionState::Connecting);

        let mut socket = loop {
            if drain_commands(&mut cmd_rx, &mut outbox) {
                state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
            match with_timeout(options.connect_timeout, open_socket(&endpoint, auth.as_ref()))
                .await
            {
                Ok(Ok(socket)) => break socket,
                Ok(Err(err)) => debug!(event = "connect_attempt_failed", error = %err),
                Err(_) => debug!(event = "connect_attempt_timed_out"),
            }
        };

        state_tx.send_replace(ConnectionState::Connected);
        debug!(event = "session_connected", pending = outbox.len());

        let outcome =
            run_connected(&mut socket, &mut cmd_rx, &mut outbox, dispatcher.as_ref(), &options)
                .await;
        state_tx.send_replace(ConnectionState::Disconnected);

        match outcome {
            SessionOutcome::Reconnect => continue,
            SessionOutcome::Shutdown => return,
        }
    }
}

/// Applies queued commands without blocking. Returns true once the command
/// channel is closed and fully drained, i.e. every session handle is gone.
fn drain_commands(cmd_rx: &mut mpsc::UnboundedReceiver<Command>, outbox: &mut Outbox) -> bool {
    loop {
        match cmd_rx.try_recv() {
            // Not connected: queue only. The flush timer picks it up later.
            Ok(Command::Submit(message)) => outbox.push(message),
            Ok(Command::PendingCount(reply)) => {
                let _ = reply.send(outbox.len());
            }
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

async fn open_socket(endpoint: &str, auth: &dyn AuthStore) -> Result<WsStream, RealtimeError> {
    let mut request = endpoint.into_client_request()?;
    let bearer = format!("Bearer {}", auth.access_token().expose_secret());
    request.headers_mut().insert(AUTHORIZATION, bearer.parse()?);

    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

async fn run_connected(
    socket: &mut WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    outbox: &mut Outbox,
    dispatcher: &dyn Dispatcher,
    options: &RealtimeOptions,
) -> SessionOutcome {
    // First tick one full interval from now: establishing a connection does
    // not flush by itself, queued entries go out on the timer.
    let mut flush = interval_at(
        Instant::now() + options.flush_interval,
        options.flush_interval,
    );

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(Command::Submit(message)) => {
                        let payload = message.payload.clone();
                        // Track before the optimistic send so a racing
                        // disconnect cannot lose the message.
                        outbox.push(message);
                        if let Err(err) = socket.send(Message::Text(payload.into())).await {
                            debug!(event = "send_failed", error = %err);
                            return SessionOutcome::Reconnect;
                        }
                    }
                    Some(Command::PendingCount(reply)) => {
                        let _ = reply.send(outbox.len());
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return SessionOutcome::Shutdown;
                    }
                }
            }
            maybe_frame = socket.next() => {
                match maybe_frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(text.as_str(), outbox, dispatcher);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionOutcome::Reconnect;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return SessionOutcome::Reconnect,
                    Some(Ok(_)) => debug!(event = "ignored_non_text_frame"),
                    Some(Err(err)) => {
                        debug!(event = "socket_error", error = %err);
                        return SessionOutcome::Reconnect;
                    }
                    None => return SessionOutcome::Reconnect,
                }
            }
            _ = flush.tick() => {
                if let Err(err) = flush_aged(socket, outbox, options.flush_grace).await {
                    debug!(event = "flush_failed", error = %err);
                    return SessionOutcome::Reconnect;
                }
            }
        }
    }
}

/// Resends every entry at least `grace` old, in insertion order. Entries are
/// never removed here; only an acknowledgment removes them.
async fn flush_aged(
    socket: &mut WsStream,
    outbox: &Outbox,
    grace: Duration,
) -> Result<(), WsError> {
    let now_ms = epoch_ms();
    let mut resent = 0_usize;
    for entry in outbox.aged(now_ms, grace) {
        socket
            .send(Message::Text(entry.payload.clone().into()))
            .await?;
        resent += 1;
    }
    if resent > 0 {
        debug!(event = "flush_resent", count = resent);
    }
    Ok(())
}

fn handle_text_frame(text: &str, outbox: &mut Outbox, dispatcher: &dyn Dispatcher) {
    let frame = match proto::decode_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "undecodable_frame", error = %err);
            return;
        }
    };

    if proto::is_ack(&frame) {
        // Swallowed either way; subscribers never observe acknowledgments.
        if let Some(correlation_id) = proto::ack_correlation_id(&frame) {
            if !outbox.acknowledge(correlation_id) {
                debug!(event = "ack_without_pending_entry", correlation_id);
            }
        }
        return;
    }

    dispatcher.dispatch(ClientEvent::Frame(frame));
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{
        drain_commands, handle_text_frame, Command, RealtimeClient, LOCAL_REALTIME_ENDPOINT,
        REALTIME_ENDPOINT,
    };
    use crate::auth::{MemoryAuthStore, TokenPair};
    use crate::dispatch::{ClientEvent, Dispatcher};
    use crate::realtime::outbox::{Outbox, PendingMessage};

    fn test_client() -> RealtimeClient {
        let auth = Arc::new(MemoryAuthStore::new(TokenPair::new("access", "refresh")));
        RealtimeClient::new(auth)
    }

    #[derive(Clone, Default)]
    struct RecordingDispatcher {
        events: Arc<Mutex<Vec<ClientEvent>>>,
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, event: ClientEvent) {
            self.events.lock().expect("events lock").push(event);
        }
    }

    fn pending(id: &str) -> PendingMessage {
        PendingMessage {
            correlation_id: id.to_string(),
            payload: format!(r#"{{"method":"sendMessage","tempId":"{id}"}}"#),
            created_at_ms: 0,
        }
    }

    #[test]
    fn realtime_client_uses_production_endpoint_by_default() {
        assert_eq!(test_client().endpoint(), REALTIME_ENDPOINT);
    }

    #[test]
    fn realtime_client_uses_local_endpoint_when_enabled() {
        assert_eq!(
            test_client().with_local_mode(true).endpoint(),
            LOCAL_REALTIME_ENDPOINT
        );
    }

    #[test]
    fn realtime_client_endpoint_override_takes_precedence() {
        let client = test_client()
            .with_local_mode(true)
            .with_endpoint("ws://session-dev.example/ws  \n");
        assert_eq!(client.endpoint(), "ws://session-dev.example/ws");
    }

    #[test]
    fn acknowledgment_removes_entry_and_is_not_forwarded() {
        let dispatcher = RecordingDispatcher::default();
        let mut outbox = Outbox::new();
        outbox.push(pending("abc"));

        handle_text_frame(
            r#"{"method":"acknowledged","tempId":"abc"}"#,
            &mut outbox,
            &dispatcher,
        );

        assert!(outbox.is_empty());
        assert!(dispatcher.events.lock().expect("events lock").is_empty());
    }

    #[test]
    fn duplicate_acknowledgment_is_swallowed_without_effect() {
        let dispatcher = RecordingDispatcher::default();
        let mut outbox = Outbox::new();
        outbox.push(pending("abc"));

        handle_text_frame(
            r#"{"method":"acknowledged","tempId":"abc"}"#,
            &mut outbox,
            &dispatcher,
        );
        handle_text_frame(
            r#"{"method":"acknowledged","tempId":"abc"}"#,
            &mut outbox,
            &dispatcher,
        );

        assert!(outbox.is_empty());
        assert!(dispatcher.events.lock().expect("events lock").is_empty());
    }

    #[test]
    fn other_frames_are_forwarded_verbatim() {
        let dispatcher = RecordingDispatcher::default();
        let mut outbox = Outbox::new();

        handle_text_frame(
            r#"{"method":"newMessage","text":"hello"}"#,
            &mut outbox,
            &dispatcher,
        );

        let events = dispatcher.events.lock().expect("events lock");
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClientEvent::Frame(frame) => {
                assert_eq!(frame, &json!({"method":"newMessage","text":"hello"}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn undecodable_frames_are_dropped() {
        let dispatcher = RecordingDispatcher::default();
        let mut outbox = Outbox::new();

        handle_text_frame("not json at all", &mut outbox, &dispatcher);

        assert!(dispatcher.events.lock().expect("events lock").is_empty());
    }

    #[tokio::test]
    async fn drained_submissions_queue_while_disconnected() {
        let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut outbox = Outbox::new();

        cmd_tx
            .send(Command::Submit(pending("queued")))
            .expect("send command");

        assert!(!drain_commands(&mut cmd_rx, &mut outbox));
        assert_eq!(outbox.len(), 1);

        drop(cmd_tx);
        assert!(drain_commands(&mut cmd_rx, &mut outbox));
    }
}
