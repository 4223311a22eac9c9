// src/connection/transport.rs
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::error::TransportError;

/// One frame on the wire: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;

/// An established transport: outbound frames go into `sink`, inbound frames
/// come out of `stream`. The stream ending means the peer closed.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transport connections. Injected into the manager so tests can
/// script connection outcomes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

/// WebSocket connector speaking JSON text frames.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let (ws_stream, response) =
            connect_async(endpoint)
                .await
                .map_err(|e| TransportError::ConnectionRefused {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(
            "WebSocket handshake with {} completed ({})",
            endpoint,
            response.status()
        );

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(TransportError::from)
            .with(|msg: WireMessage| {
                future::ready(
                    serde_json::to_string(&msg)
                        .map(Message::Text)
                        .map_err(TransportError::from),
                )
            });

        // Close frames end the stream; control and binary frames are dropped.
        let stream = read
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireMessage>(&text) {
                        Ok(msg) => Some(Ok(msg)),
                        Err(e) => {
                            warn!("Skipping malformed frame: {}", e);
                            None
                        }
                    },
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary frame");
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
