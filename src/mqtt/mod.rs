//! MQTT module - transport seam, rumqttc client, and connection manager

mod client;
mod manager;
#[cfg(test)]
pub(crate) mod mock;
mod session;

pub use client::RumqttTransport;
pub use manager::{ConnectionManager, ConnectionState, Timeouts};
pub use session::{EventSource, Session, SessionEvent, SessionHandle, SessionOptions, Transport};
