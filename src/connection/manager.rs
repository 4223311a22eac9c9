// src/connection/manager.rs
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, Receiver, Sender, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};

use super::{
    policy::ReconnectPolicy,
    state::{ConnectionState, SessionDetails, StateCell},
    subscription::{EventHandler, EventRegistry, InboundEvent, SubscriptionId, Unsubscribe},
    transport::{Connection, Connector, WireMessage},
};
use crate::credentials::CredentialProvider;
use crate::error::{RealtimeError, TransportError};

/// Outbound authentication request.
pub const AUTHENTICATE_EVENT: &str = "authenticate";
/// Inbound authentication response.
pub const AUTHENTICATED_EVENT: &str = "authenticated";
/// Lifecycle: transport connected.
pub const CONNECT_EVENT: &str = "connect";
/// Lifecycle: established transport lost.
pub const DISCONNECT_EVENT: &str = "disconnect";
/// Lifecycle: a connection attempt failed.
pub const CONNECT_ERROR_EVENT: &str = "connect_error";
/// Lifecycle: attempt budget exhausted, manual `start()` required.
pub const RECONNECT_FAILED_EVENT: &str = "reconnect_failed";

/// `disconnect` reason when the connection is closed locally by `stop()`.
pub const STOPPED_REASON: &str = "stopped";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tuning for the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub command_buffer: usize,
}

impl ManagerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(20),
            reconnect_attempts: 10,
            reconnect_delay: Duration::from_millis(1000),
            command_buffer: 100,
        }
    }
}

// Commands that can be sent to the session task
#[derive(Debug)]
enum SessionCommand {
    Emit(WireMessage),
}

// Why the connection loop returned
#[derive(Debug)]
enum ConnectionEnd {
    Stopped,
    Lost(String),
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    success: bool,
    #[serde(default)]
    identity: Option<String>,
}

struct Session {
    command_tx: Sender<SessionCommand>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

// State shared between the public handle and the session task.
struct Shared {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    state: StateCell,
    registry: Arc<EventRegistry>,
}

/// Owns the single realtime connection for a dashboard session.
///
/// `start`, `stop`, `emit`, `subscribe` and `state` never block on the
/// network. All transport work, state transitions and handler invocations
/// happen on one background task per started session, so events reach
/// handlers in arrival order and handlers for an event run in
/// registration order.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        info!("Realtime endpoint configured at {}", config.endpoint);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                credentials,
                state: StateCell::new(),
                registry: EventRegistry::new(),
            }),
            session: Mutex::new(None),
        }
    }

    /// Begin connecting. Does nothing while a session is connecting, online,
    /// or waiting to reconnect after a dropped connection. From
    /// `disconnected` (after `stop()`) or `failed`, starts over with a fresh
    /// attempt counter.
    pub fn start(&self) -> Result<(), RealtimeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;

        let mut session = self.lock_session();
        if let Some(existing) = session.take() {
            // A session in `failed` is either waiting out a retry delay or
            // about to exit after exhausting its budget; both may be replaced.
            let replaceable =
                existing.task.is_finished() || self.state() == ConnectionState::Failed;
            if !replaceable {
                debug!("start() ignored, session already active");
                *session = Some(existing);
                return Ok(());
            }
            let _ = existing.shutdown_tx.send(());
        }

        let (epoch, _) = self.shared.state.advance(ConnectionState::Connecting);

        let (command_tx, command_rx) = mpsc::channel(self.shared.config.command_buffer);
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();

        let task = runtime.spawn(run_session(
            Arc::clone(&self.shared),
            epoch,
            command_rx,
            shutdown_rx,
        ));

        *session = Some(Session {
            command_tx,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Close the transport and cancel any pending reconnect. Safe to call
    /// repeatedly.
    pub fn stop(&self) {
        if let Some(session) = self.retire() {
            info!("Stopping realtime connection");
            let _ = session.shutdown_tx.send(());
        }
    }

    /// `stop()` and wait for the session task to close the transport.
    pub async fn shutdown(&self) {
        let Some(session) = self.retire() else {
            return;
        };
        info!("Shutting down realtime connection");
        let _ = session.shutdown_tx.send(());

        let mut task = session.task;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Realtime session task failed: {}", e),
            Err(_) => {
                error!("Timeout waiting for realtime session to close, aborting");
                task.abort();
            }
        }
    }

    /// Register `handler` for `event`. Lifecycle events (`connect`,
    /// `disconnect`, `connect_error`, `reconnect_failed`) are subscribed to
    /// the same way as peer events.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let unsubscribe = self
            .shared
            .registry
            .subscribe(event, EventHandler::new(event, handler));
        debug!("Subscribed {} to '{}'", unsubscribe.id(), event);
        unsubscribe
    }

    /// Remove a subscription by its ID
    pub fn remove_subscription(&self, id: SubscriptionId) -> bool {
        self.shared.registry.remove(id)
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.shared.registry.subscriber_count(event)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Latest-value view of the state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.watch()
    }

    /// Every transition, in order, from the moment of the call.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state.changes()
    }

    /// Identity confirmed by the last successful handshake on the current
    /// connection.
    pub fn identity(&self) -> Option<String> {
        self.shared.state.identity()
    }

    /// Consecutive failed connection attempts in the current session.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.state.failures()
    }

    /// Send `event` to the peer. Only delivered while `connected` or
    /// `authenticated`; otherwise dropped with a diagnostic. Callers that
    /// need delivery must check `state()` or queue themselves.
    pub fn emit(&self, event: &str, payload: Value) {
        let state = self.state();
        if !state.can_emit() {
            warn!("Dropping '{}' emitted while {}", event, state);
            return;
        }

        let session = self.lock_session();
        let Some(session) = session.as_ref() else {
            warn!("Dropping '{}', no active session", event);
            return;
        };

        match session
            .command_tx
            .try_send(SessionCommand::Emit(WireMessage::new(event, payload)))
        {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Dropping '{}', outbound queue full", event),
            Err(TrySendError::Closed(_)) => warn!("Dropping '{}', session closed", event),
        }
    }

    // Retire the running session and move to `disconnected`. If a transport
    // was up, subscribers get `disconnect {reason: "stopped"}`; the retired
    // task delivers nothing after this.
    fn retire(&self) -> Option<Session> {
        let session = self.lock_session().take();
        let (_, previous) = self.shared.state.advance(ConnectionState::Disconnected);
        if previous.is_online() {
            let event = InboundEvent::new(DISCONNECT_EVENT, json!({ "reason": STOPPED_REASON }));
            self.shared.registry.dispatch(&event);
        }
        session
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

// Context passed through the session task
struct SessionContext {
    shared: Arc<Shared>,
    epoch: u64,
}

impl SessionContext {
    fn transition(&self, next: ConnectionState) -> bool {
        self.shared.state.transition(self.epoch, next)
    }

    fn update<F>(&self, next: Option<ConnectionState>, f: F) -> bool
    where
        F: FnOnce(&mut SessionDetails),
    {
        self.shared.state.update(self.epoch, next, f)
    }

    fn is_current(&self) -> bool {
        self.shared.state.is_current(self.epoch)
    }

    fn dispatch(&self, event: InboundEvent) {
        if !self.is_current() {
            debug!("Discarding '{}' from a retired session", event.name);
            return;
        }
        let delivered = self.shared.registry.dispatch(&event);
        debug!("Delivered '{}' to {} subscriber(s)", event.name, delivered);
    }

    fn lifecycle(&self, name: &str, payload: Value) {
        self.dispatch(InboundEvent::new(name, payload));
    }
}

// Main session loop: connect, drive the connection, reconnect on loss.
async fn run_session(
    shared: Arc<Shared>,
    epoch: u64,
    mut command_rx: Receiver<SessionCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ctx = SessionContext { shared, epoch };
    let config = ctx.shared.config.clone();
    let mut policy = ReconnectPolicy::new(config.reconnect_delay, config.reconnect_attempts);

    'session: loop {
        if !ctx.transition(ConnectionState::Connecting) {
            break 'session;
        }

        info!("Connecting to {} (attempt #{})", config.endpoint, policy.failures() + 1);
        let attempt = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break 'session,
            result = tokio::time::timeout(
                config.connect_timeout,
                ctx.shared.connector.connect(&config.endpoint),
            ) => result,
        };

        let connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                if fail_attempt(&ctx, &mut policy, e, &mut shutdown_rx).await {
                    continue 'session;
                }
                break 'session;
            }
            Err(_) => {
                let e = TransportError::HandshakeTimeout {
                    endpoint: config.endpoint.clone(),
                    timeout_ms: config.connect_timeout.as_millis() as u64,
                };
                if fail_attempt(&ctx, &mut policy, e, &mut shutdown_rx).await {
                    continue 'session;
                }
                break 'session;
            }
        };

        policy.reset();
        if !ctx.update(Some(ConnectionState::Connected), |d| d.failures = 0) {
            break 'session;
        }
        info!("Connected to {}", config.endpoint);
        ctx.lifecycle(CONNECT_EVENT, Value::Null);

        match drive_connection(&ctx, connection, &mut command_rx, &mut shutdown_rx).await {
            ConnectionEnd::Stopped => break 'session,
            ConnectionEnd::Lost(reason) => {
                warn!("Connection lost: {}", reason);
                if !ctx.update(Some(ConnectionState::Disconnected), |d| d.identity = None) {
                    break 'session;
                }
                ctx.lifecycle(DISCONNECT_EVENT, json!({ "reason": reason }));

                let delay = policy.retry_delay();
                info!("Will attempt reconnection in {} ms", delay.as_millis());
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break 'session,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("Realtime session {} exiting", epoch);
}

// Record a failed attempt and wait out the retry delay.
// Returns false when the session should end.
async fn fail_attempt(
    ctx: &SessionContext,
    policy: &mut ReconnectPolicy,
    error: TransportError,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> bool {
    let next = policy.record_failure();
    let attempt = policy.failures();
    if !ctx.update(Some(ConnectionState::Failed), |d| d.failures = attempt) {
        return false;
    }
    warn!("Connection attempt #{} failed: {}", attempt, error);
    ctx.lifecycle(
        CONNECT_ERROR_EVENT,
        json!({ "error": error.to_string(), "attempt": attempt }),
    );

    match next {
        Some(delay) => {
            info!(
                "Will attempt reconnection in {} ms (attempt #{} of {})",
                delay.as_millis(),
                attempt + 1,
                policy.max_attempts()
            );
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        }
        None => {
            error!(
                "Giving up after {} consecutive failed connection attempts",
                attempt
            );
            ctx.lifecycle(RECONNECT_FAILED_EVENT, json!({ "attempts": attempt }));
            false
        }
    }
}

// Authenticate if a credential is stored, then pump commands and inbound
// frames until the transport drops or the session is stopped.
async fn drive_connection(
    ctx: &SessionContext,
    connection: Connection,
    command_rx: &mut Receiver<SessionCommand>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> ConnectionEnd {
    let Connection {
        mut sink,
        mut stream,
    } = connection;

    // Queued emits belong to the previous connection.
    while command_rx.try_recv().is_ok() {}

    if let Some(credential) = ctx.shared.credentials.credential().await {
        let request = WireMessage::new(AUTHENTICATE_EVENT, json!({ "credential": credential }));
        if let Err(e) = sink.send(request).await {
            return ConnectionEnd::Lost(format!("failed to send authentication: {e}"));
        }
        if !ctx.transition(ConnectionState::Authenticating) {
            let _ = sink.close().await;
            return ConnectionEnd::Stopped;
        }
        debug!("Authentication request sent");
    } else {
        debug!("No credential stored, staying unauthenticated");
    }

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                if let Err(e) = sink.close().await {
                    debug!("Error closing transport: {}", e);
                }
                return ConnectionEnd::Stopped;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        if !ctx.is_current() {
                            let _ = sink.close().await;
                            return ConnectionEnd::Stopped;
                        }
                        if msg.event == AUTHENTICATED_EVENT {
                            handle_auth_response(ctx, &msg.data);
                        }
                        ctx.dispatch(InboundEvent::new(msg.event, msg.data));
                    }
                    Some(Err(e)) => return ConnectionEnd::Lost(e.to_string()),
                    None => return ConnectionEnd::Lost("transport closed".to_string()),
                }
            }

            Some(cmd) = command_rx.recv() => {
                match cmd {
                    SessionCommand::Emit(msg) => {
                        let state = ctx.shared.state.get();
                        if !state.can_emit() {
                            warn!("Dropping '{}' queued while {}", msg.event, state);
                            continue;
                        }
                        let event = msg.event.clone();
                        if let Err(e) = sink.send(msg).await {
                            return ConnectionEnd::Lost(format!("failed to send '{event}': {e}"));
                        }
                    }
                }
            }
        }
    }
}

fn handle_auth_response(ctx: &SessionContext, data: &Value) {
    if ctx.shared.state.get() != ConnectionState::Authenticating {
        debug!("Ignoring unsolicited authentication response");
        return;
    }

    match serde_json::from_value::<AuthResponse>(data.clone()) {
        Ok(AuthResponse {
            success: true,
            identity,
        }) => {
            info!(
                "Authenticated as {}",
                identity.as_deref().unwrap_or("<unnamed>")
            );
            ctx.update(Some(ConnectionState::Authenticated), |d| d.identity = identity);
        }
        Ok(AuthResponse { success: false, .. }) => {
            warn!("Authentication rejected, continuing unauthenticated");
            ctx.transition(ConnectionState::Connected);
        }
        Err(e) => {
            warn!("Malformed authentication response ({}), continuing unauthenticated", e);
            ctx.transition(ConnectionState::Connected);
        }
    }
}
