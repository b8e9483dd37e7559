//! Shared, lock-guarded state fed by the coordinator and read by the UI

mod devices;
mod message_log;

pub use devices::{DeviceStore, OutletRecord};
pub use message_log::{Direction, LogEntry, MessageLog, DEFAULT_CAPACITY};
