//! Error types for powercontrol

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("subscribe failed: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("stored password unusable: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("password could not be protected: {0}")]
    Encrypt(#[from] EncryptError),
}

/// Inbound topic does not have the `power/<device>/outlets/<outlet>` shape
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("malformed status topic {topic:?}: {reason}")]
    Malformed { topic: String, reason: &'static str },
}

/// Errors reported by [`ConnectionManager::connect`](crate::mqtt::ConnectionManager::connect)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("timed out waiting for the broker to acknowledge the connection")]
    Timeout,

    #[error("broker rejected the credentials: {0}")]
    AuthFailed(String),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("session setup failed: {0}")]
    Setup(String),
}

/// Errors reported by [`ConnectionManager::subscribe`](crate::mqtt::ConnectionManager::subscribe)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("timed out waiting for subscription acknowledgement")]
    Timeout,

    #[error("not connected to broker")]
    NotConnected,

    #[error("broker refused subscription to {0}")]
    Rejected(String),

    #[error("client error: {0}")]
    Transport(String),
}

/// Errors reported by [`ConnectionManager::publish`](crate::mqtt::ConnectionManager::publish)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("timed out handing the message to the client")]
    Timeout,

    #[error("client error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DecryptError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EncryptError(pub String);

pub type Result<T> = std::result::Result<T, Error>;
