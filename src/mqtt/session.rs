//! Transport seam between the connection manager and an MQTT client library

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConnectError, PublishError, SubscribeError};

/// Parameters for opening a broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// What the transport reports from its delivery loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker accepted the connection (first connect or a silent reconnect)
    Connected,
    /// Broker refused the connection
    Refused(ConnectError),
    /// Link dropped or could not be established
    LinkLost(String),
    /// Subscription acknowledged; `granted` is false when the broker refused it
    SubAck { granted: bool },
    /// Inbound publish
    Message { topic: String, payload: String },
}

/// Outbound side of a live session. Calls hand requests to the client and
/// return once they are queued; acknowledgements arrive as [`SessionEvent`]s.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), SubscribeError>;
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError>;
    async fn close(&self);
}

/// Inbound side of a live session, polled by exactly one delivery task
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> SessionEvent;
}

/// A freshly opened session. The link is dialled when the event source is
/// first polled.
pub struct Session {
    pub handle: Arc<dyn SessionHandle>,
    pub events: Box<dyn EventSource>,
}

/// Factory for sessions
pub trait Transport: Send + Sync {
    fn open(&self, options: &SessionOptions) -> Result<Session, ConnectError>;
}
