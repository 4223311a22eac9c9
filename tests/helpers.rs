// tests/helpers.rs
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, channel::mpsc as channel};
use print_realtime::connection::{
    Connection, ConnectionManager, ConnectionState, Connector, InboundEvent, ManagerConfig,
    WireMessage,
};
use print_realtime::credentials::StaticCredential;
use print_realtime::error::TransportError;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const ENDPOINT: &str = "ws://dashboard.test/socket";
const WAIT: Duration = Duration::from_secs(300);

/// What the next connection attempt does.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Accept,
    Refuse,
    /// Never completes the handshake.
    Hang,
}

/// Server side of one accepted mock connection.
pub struct MockPeer {
    sent: channel::UnboundedReceiver<WireMessage>,
    inbound: Option<channel::UnboundedSender<Result<WireMessage, TransportError>>>,
}

impl MockPeer {
    /// Next frame the client sent.
    pub async fn next_sent(&mut self) -> WireMessage {
        tokio::time::timeout(WAIT, self.sent.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed the connection")
    }

    /// True if nothing has been sent and the client still holds the sink open.
    pub fn sent_nothing(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    /// Resolves once the client closes its side.
    pub async fn closed_by_client(&mut self) -> bool {
        matches!(tokio::time::timeout(WAIT, self.sent.next()).await, Ok(None))
    }

    pub fn push(&self, event: &str, data: Value) {
        self.inbound
            .as_ref()
            .expect("connection already dropped")
            .unbounded_send(Ok(WireMessage::new(event, data)))
            .expect("client stopped reading");
    }

    /// Abruptly end the connection from the server side.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }
}

pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    /// Attempts beyond the script are refused.
    pub fn new(script: Vec<Outcome>) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
            peers,
        });
        (connector, peer_rx)
    }

    pub fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Refuse);

        match outcome {
            Outcome::Refuse => Err(TransportError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            }),
            Outcome::Hang => futures::future::pending().await,
            Outcome::Accept => {
                let (sent_tx, sent_rx) = channel::unbounded();
                let (inbound_tx, inbound_rx) = channel::unbounded();
                let _ = self.peers.send(MockPeer {
                    sent: sent_rx,
                    inbound: Some(inbound_tx),
                });
                Ok(Connection {
                    sink: Box::pin(
                        sent_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string())),
                    ),
                    stream: Box::pin(inbound_rx),
                })
            }
        }
    }
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig::new(ENDPOINT)
}

pub fn setup_manager(
    script: Vec<Outcome>,
    credential: Option<&str>,
) -> (
    ConnectionManager,
    Arc<MockConnector>,
    mpsc::UnboundedReceiver<MockPeer>,
) {
    let (connector, peers) = MockConnector::new(script);
    let credentials = match credential {
        Some(token) => StaticCredential::new(token),
        None => StaticCredential::none(),
    };
    let manager = ConnectionManager::new(
        test_config(),
        Arc::clone(&connector) as Arc<dyn Connector>,
        Arc::new(credentials),
    );
    (manager, connector, peers)
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    tokio::time::timeout(WAIT, peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

pub async fn next_state(states: &mut broadcast::Receiver<ConnectionState>) -> ConnectionState {
    tokio::time::timeout(WAIT, states.recv())
        .await
        .expect("timed out waiting for a state change")
        .expect("state channel closed")
}

/// Collect transitions up to and including `target`.
pub async fn states_until(
    states: &mut broadcast::Receiver<ConnectionState>,
    target: ConnectionState,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    loop {
        let state = next_state(states).await;
        seen.push(state);
        if state == target {
            return seen;
        }
    }
}

pub async fn take_states(
    states: &mut broadcast::Receiver<ConnectionState>,
    count: usize,
) -> Vec<ConnectionState> {
    let mut seen = Vec::with_capacity(count);
    for _ in 0..count {
        seen.push(next_state(states).await);
    }
    seen
}

/// Forward every `event` the manager delivers into a channel.
pub fn record(manager: &ConnectionManager, event: &str) -> mpsc::UnboundedReceiver<InboundEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.subscribe(event, move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}
