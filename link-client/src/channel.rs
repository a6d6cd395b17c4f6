// link-client/src/channel.rs
use common::messages::{ClientFrame, ErrorEnvelope, Incoming, ServerFrame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use crate::reconnect::ReconnectPolicy;

/// Lifecycle of one logical linking session. Superseded, never mutated in
/// place, when the connection is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AuthPending,
    Authenticated,
    AwaitingChallenge,
    AwaitingProof,
    Verifying,
    Linked,
    Failed,
}

/// Wake-up that moves the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    TransportOpened,
    AuthAccepted,
    AuthRejected,
    ChallengeRequested,
    ChallengeDelivered,
    ChallengeUnavailable,
    ProofSubmitted,
    VerifyAccepted,
    VerifyRejected,
    Unauthorized,
    ServerFault,
    TransportLost,
}

impl SessionState {
    /// Pure transition function: old state + event -> new state
    pub fn apply(self, event: SessionEvent) -> SessionState {
        use SessionEvent::*;
        match event {
            ConnectRequested => SessionState::Connecting,
            TransportOpened => SessionState::AuthPending,
            // Re-authentication keeps the transport; only the auth step restarts
            Unauthorized => SessionState::AuthPending,
            AuthAccepted => SessionState::Authenticated,
            AuthRejected => SessionState::Failed,
            ChallengeRequested => SessionState::AwaitingChallenge,
            ChallengeDelivered => SessionState::AwaitingProof,
            ChallengeUnavailable => SessionState::Authenticated,
            ProofSubmitted => SessionState::Verifying,
            VerifyAccepted => SessionState::Linked,
            VerifyRejected => SessionState::Authenticated,
            ServerFault => SessionState::Failed,
            TransportLost => SessionState::Disconnected,
        }
    }
}

/// Events surfaced to channel subscribers
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Frame(ServerFrame),
    ServerError(ErrorEnvelope),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("invalid websocket url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("channel driver is gone")]
    Closed,
}

/// Connection settings for one session channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ws_url: String,
    /// Identity assertion sent as the authentication message
    pub init_data: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(ws_url: String, init_data: String) -> Self {
        Self {
            ws_url,
            init_data,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &common::Config, init_data: String) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            init_data,
            reconnect: ReconnectPolicy::from_config(&config.link),
            heartbeat_interval: Duration::from_secs(config.link.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.link.heartbeat_interval_secs * 6),
        }
    }
}

/// Owns the persistent connection, the authentication handshake over it, and
/// message dispatch. All state transitions are serialized through a single
/// driver task; timers and transport callbacks funnel through its event loop.
pub struct SessionChannel {
    config: Arc<ChannelConfig>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    events_tx: broadcast::Sender<ChannelEvent>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionChannel {
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        // Reject a bad endpoint up front instead of on the first connect
        Url::parse(&config.ws_url)?;

        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);

        Ok(Self {
            config: Arc::new(config),
            state_tx: Arc::new(state_tx),
            state_rx,
            events_tx,
            command_tx: Mutex::new(None),
            driver: Mutex::new(None),
        })
    }

    /// Open the connection, fully tearing down any previous one first.
    /// Cancels every wait tied to the old connection.
    pub fn connect(&self) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                tracing::info!("Replacing existing link connection");
                handle.abort();
                // Cancel every wait tied to the old connection
                let _ = self.events_tx.send(ChannelEvent::Disconnected);
            }
            if let Ok(mut tx) = self.command_tx.lock() {
                *tx = Some(command_tx);
            }
            *driver = Some(tokio::spawn(run_driver(
                self.config.clone(),
                self.state_tx.clone(),
                self.events_tx.clone(),
                command_rx,
            )));
        }
    }

    /// Tear the connection down explicitly
    pub fn disconnect(&self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
        if let Ok(mut tx) = self.command_tx.lock() {
            *tx = None;
        }
        let _ = self.state_tx.send(SessionState::Disconnected);
        let _ = self.events_tx.send(ChannelEvent::Disconnected);
    }

    /// Queueing while offline risks replaying a request against a rotated
    /// challenge, so sends fail fast instead.
    pub fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        match self.current_state() {
            SessionState::Disconnected | SessionState::Connecting => {
                return Err(ChannelError::NotConnected);
            }
            _ => {}
        }

        let guard = self.command_tx.lock().map_err(|_| ChannelError::Closed)?;
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::NotConnected),
        }
    }

    pub fn current_state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch every state change
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Subscribe to server frames and connection events
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }
}

// Serialized owner of the session state; every transition goes through here
struct StatePublisher {
    current: SessionState,
    tx: Arc<watch::Sender<SessionState>>,
}

impl StatePublisher {
    fn current(&self) -> SessionState {
        self.current
    }

    fn advance(&mut self, event: SessionEvent) {
        let next = self.current.apply(event);
        if next != self.current {
            tracing::debug!("Session state {:?} -> {:?} on {:?}", self.current, next, event);
            self.current = next;
            let _ = self.tx.send(next);
        }
    }
}

enum ConnectionEnd {
    /// Transport lost; the driver reconnects
    Dropped,
    /// Explicit server failure; surfaced, not retried
    Fatal,
    /// The channel handle was dropped
    Finished,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

async fn run_driver(
    config: Arc<ChannelConfig>,
    state_tx: Arc<watch::Sender<SessionState>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    mut command_rx: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let mut states = StatePublisher { current: SessionState::Disconnected, tx: state_tx };
    let mut attempt: u32 = 0;

    loop {
        states.advance(SessionEvent::ConnectRequested);
        let connection_id = Uuid::new_v4();

        match connect_async(config.ws_url.clone()).await {
            Ok((ws, _)) => {
                tracing::info!("Connected to link server: {}", connection_id);
                // A successful reconnect resets the attempt counter
                attempt = 0;

                match drive_connection(&config, &mut states, &events_tx, &mut command_rx, ws, connection_id).await {
                    ConnectionEnd::Dropped => {}
                    ConnectionEnd::Fatal => {
                        // Terminal failure: surfaced, never retried
                        let _ = events_tx.send(ChannelEvent::Disconnected);
                        return;
                    }
                    ConnectionEnd::Finished => {
                        states.advance(SessionEvent::TransportLost);
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to connect to link server: {}", e);
            }
        }

        states.advance(SessionEvent::TransportLost);
        let _ = events_tx.send(ChannelEvent::Disconnected);

        // The policy is consulted exactly once per disconnect
        let delay = config.reconnect.next_delay(attempt);
        attempt += 1;
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::time::sleep(delay).await;
    }
}

async fn drive_connection(
    config: &ChannelConfig,
    states: &mut StatePublisher,
    events: &broadcast::Sender<ChannelEvent>,
    command_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    connection_id: Uuid,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();

    // Authenticate as soon as the transport is open
    states.advance(SessionEvent::TransportOpened);
    if send_frame(&mut sink, &auth_frame(config)).await.is_err() {
        return ConnectionEnd::Dropped;
    }
    tracing::info!("Sent identity assertion on connection: {}", connection_id);

    // Last request still waiting for a server reply, kept for redelivery
    // after a mid-flight re-authentication
    let mut pending: Option<ClientFrame> = None;
    let mut reauth_attempts: u32 = 0;
    let mut last_heartbeat = Instant::now();
    let mut ping_interval = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_heartbeat.elapsed() > config.heartbeat_timeout {
                    tracing::warn!("Heartbeat timeout on connection: {}", connection_id);
                    return ConnectionEnd::Dropped;
                }
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }

            command = command_rx.recv() => {
                let frame = match command {
                    Some(frame) => frame,
                    None => {
                        // Channel handle dropped; close cleanly
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return ConnectionEnd::Finished;
                    }
                };

                match &frame {
                    ClientFrame::GetTonProof => {
                        pending = Some(frame.clone());
                        reauth_attempts = 0;
                        states.advance(SessionEvent::ChallengeRequested);
                    }
                    ClientFrame::Verify { .. } => {
                        pending = Some(frame.clone());
                        reauth_attempts = 0;
                        states.advance(SessionEvent::ProofSubmitted);
                    }
                    ClientFrame::Auth { .. } => {}
                }

                if send_frame(&mut sink, &frame).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_heartbeat = Instant::now();
                        match serde_json::from_str::<Incoming>(&text) {
                            Ok(Incoming::Frame(frame)) => {
                                if let Some(end) = handle_frame(
                                    states, events, &mut sink, &mut pending, frame,
                                ).await {
                                    return end;
                                }
                            }
                            Ok(Incoming::Error(envelope)) => {
                                if let Some(end) = handle_error(
                                    config, states, events, &mut sink, &mut reauth_attempts, envelope,
                                ).await {
                                    return end;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Unparseable server message: {}", e);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        last_heartbeat = Instant::now();
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            return ConnectionEnd::Dropped;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_heartbeat = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(reason))) => {
                        tracing::info!("Server closed connection {}: {:?}", connection_id, reason);
                        return ConnectionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error on connection {}: {}", connection_id, e);
                        return ConnectionEnd::Dropped;
                    }
                    None => {
                        return ConnectionEnd::Dropped;
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    states: &mut StatePublisher,
    events: &broadcast::Sender<ChannelEvent>,
    sink: &mut WsSink,
    pending: &mut Option<ClientFrame>,
    frame: ServerFrame,
) -> Option<ConnectionEnd> {
    let mut outcome = None;

    match &frame {
        ServerFrame::Auth { ok: true } if states.current() == SessionState::AuthPending => {
            states.advance(SessionEvent::AuthAccepted);
            // Resume the step that was in flight before re-authentication
            if let Some(request) = pending.clone() {
                tracing::info!("Re-authenticated; redelivering pending request");
                let resumed = match &request {
                    ClientFrame::Verify { .. } => SessionEvent::ProofSubmitted,
                    _ => SessionEvent::ChallengeRequested,
                };
                if send_frame(sink, &request).await.is_err() {
                    return Some(ConnectionEnd::Dropped);
                }
                states.advance(resumed);
            }
        }
        ServerFrame::Auth { ok: true } => {
            tracing::debug!("Ignoring duplicate auth acceptance");
        }
        ServerFrame::Auth { ok: false } => {
            tracing::error!("Authentication rejected by link server");
            states.advance(SessionEvent::AuthRejected);
            outcome = Some(ConnectionEnd::Fatal);
        }
        ServerFrame::TonProof { .. } => {
            *pending = None;
            states.advance(SessionEvent::ChallengeDelivered);
        }
        ServerFrame::ErrorProof { message } => {
            tracing::warn!("Link server cannot issue a challenge: {}", message);
            *pending = None;
            states.advance(SessionEvent::ChallengeUnavailable);
        }
        ServerFrame::Verify { ok, .. } => {
            *pending = None;
            states.advance(if *ok {
                SessionEvent::VerifyAccepted
            } else {
                SessionEvent::VerifyRejected
            });
        }
    }

    let _ = events.send(ChannelEvent::Frame(frame));
    outcome
}

async fn handle_error(
    config: &ChannelConfig,
    states: &mut StatePublisher,
    events: &broadcast::Sender<ChannelEvent>,
    sink: &mut WsSink,
    reauth_attempts: &mut u32,
    envelope: ErrorEnvelope,
) -> Option<ConnectionEnd> {
    if envelope.is_unauthorized() {
        // Authorization errors get exactly one re-authentication retry
        if *reauth_attempts >= 1 {
            tracing::error!("Still unauthorized after re-authentication: {}", envelope.error);
            states.advance(SessionEvent::ServerFault);
            let _ = events.send(ChannelEvent::ServerError(envelope));
            return Some(ConnectionEnd::Fatal);
        }
        *reauth_attempts += 1;

        tracing::warn!("Session unauthorized; re-sending identity assertion");
        states.advance(SessionEvent::Unauthorized);
        if send_frame(sink, &auth_frame(config)).await.is_err() {
            return Some(ConnectionEnd::Dropped);
        }
        return None;
    }

    tracing::error!("Link server error {}: {}", envelope.code, envelope.error);
    states.advance(SessionEvent::ServerFault);
    let _ = events.send(ChannelEvent::ServerError(envelope));
    Some(ConnectionEnd::Fatal)
}

fn auth_frame(config: &ChannelConfig) -> ClientFrame {
    ClientFrame::Auth { init_data: config.init_data.clone() }
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), ()> {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(WsMessage::Text(json)).await.map_err(|e| {
            tracing::error!("Error sending to link server: {}", e);
        }),
        Err(e) => {
            tracing::error!("Failed to serialize client frame: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_returns_to_auth_pending_from_any_progress_state() {
        for state in [
            SessionState::AuthPending,
            SessionState::Authenticated,
            SessionState::AwaitingChallenge,
            SessionState::AwaitingProof,
            SessionState::Verifying,
        ] {
            assert_eq!(state.apply(SessionEvent::Unauthorized), SessionState::AuthPending);
        }
    }

    #[test]
    fn transport_loss_always_disconnects() {
        for state in [
            SessionState::Connecting,
            SessionState::AuthPending,
            SessionState::Authenticated,
            SessionState::AwaitingChallenge,
            SessionState::Verifying,
        ] {
            assert_eq!(state.apply(SessionEvent::TransportLost), SessionState::Disconnected);
        }
    }

    #[test]
    fn handshake_progression() {
        let state = SessionState::Disconnected
            .apply(SessionEvent::ConnectRequested)
            .apply(SessionEvent::TransportOpened)
            .apply(SessionEvent::AuthAccepted)
            .apply(SessionEvent::ChallengeRequested)
            .apply(SessionEvent::ChallengeDelivered)
            .apply(SessionEvent::ProofSubmitted)
            .apply(SessionEvent::VerifyAccepted);
        assert_eq!(state, SessionState::Linked);
    }

    #[test]
    fn rejection_returns_to_authenticated() {
        assert_eq!(
            SessionState::Verifying.apply(SessionEvent::VerifyRejected),
            SessionState::Authenticated
        );
        assert_eq!(
            SessionState::AwaitingChallenge.apply(SessionEvent::ChallengeUnavailable),
            SessionState::Authenticated
        );
    }

    #[test]
    fn server_faults_are_terminal() {
        assert_eq!(
            SessionState::Authenticated.apply(SessionEvent::ServerFault),
            SessionState::Failed
        );
        assert_eq!(SessionState::AuthPending.apply(SessionEvent::AuthRejected), SessionState::Failed);
    }

    #[tokio::test]
    async fn send_fails_fast_while_disconnected() {
        let channel = SessionChannel::new(ChannelConfig::new(
            "ws://127.0.0.1:9".to_string(),
            "user_id=42&hash=aa".to_string(),
        ))
        .unwrap();

        let result = channel.send(ClientFrame::GetTonProof);
        assert!(matches!(result, Err(ChannelError::NotConnected)));
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let config = ChannelConfig::new("not a url".to_string(), String::new());
        assert!(matches!(SessionChannel::new(config), Err(ChannelError::InvalidUrl(_))));
    }
}
