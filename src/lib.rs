//! powercontrol - control panel core for MQTT power strips
//!
//! Tracks outlet state reported on `power/<device>/outlets/<n>`, keeps a
//! bounded log of broker traffic, and switches outlets by publishing to
//! `power/<device>/outlets/<n>/set`. The broker session reconnects on its
//! own and re-subscribes after every reconnect.

pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod mqtt;
pub mod store;
pub mod topic;

pub use coordinator::{Coordinator, CoordinatorOptions, UiEvent};
pub use error::{Error, Result};
