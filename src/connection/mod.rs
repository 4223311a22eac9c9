// src/connection/mod.rs
mod manager;
mod policy;
mod state;
mod subscription;
mod transport;

pub use manager::{
    AUTHENTICATE_EVENT, AUTHENTICATED_EVENT, CONNECT_ERROR_EVENT, CONNECT_EVENT,
    ConnectionManager, DISCONNECT_EVENT, ManagerConfig, RECONNECT_FAILED_EVENT, STOPPED_REASON,
};
pub use policy::ReconnectPolicy;
pub use state::ConnectionState;
pub use subscription::{EventHandler, InboundEvent, SubscriptionId, Unsubscribe};
pub use transport::{Connection, Connector, FrameSink, FrameStream, WireMessage, WsConnector};
