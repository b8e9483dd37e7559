//! Topic and payload codec for power strips
//!
//! Status:  `power/<device>/outlets/<outlet>` with payload `0` / `1`
//! Command: `power/<device>/outlets/<outlet>/set` with payload `0` / `1`

use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::TopicError;

/// First topic segment
const ROOT: &str = "power";
/// Third topic segment
const OUTLETS: &str = "outlets";
/// Command topic suffix
const SET_SUFFIX: &str = "set";

/// Key of an outlet: device name plus outlet number, both taken verbatim
/// from the wire (case-sensitive).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletIdentity {
    pub device_name: String,
    pub outlet_number: String,
}

impl OutletIdentity {
    pub fn new(device_name: impl Into<String>, outlet_number: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            outlet_number: outlet_number.into(),
        }
    }

    /// Topic a device publishes this outlet's state on
    pub fn status_topic(&self) -> String {
        encode_status_topic(&self.device_name, &self.outlet_number)
    }

    /// Topic to publish on to switch this outlet
    pub fn command_topic(&self) -> String {
        encode_command_topic(&self.device_name, &self.outlet_number)
    }
}

impl fmt::Display for OutletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_name, self.outlet_number)
    }
}

/// Observed outlet state.
///
/// Payloads other than `0` / `1` are kept as-is in [`OutletState::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutletState {
    On,
    Off,
    Other(String),
}

impl OutletState {
    pub fn as_str(&self) -> &str {
        match self {
            OutletState::On => "ON",
            OutletState::Off => "OFF",
            OutletState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for OutletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OutletState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Parse a status topic into its outlet identity.
///
/// Exactly four segments are accepted, so command topics (`.../set`) are
/// rejected here.
pub fn decode_status_topic(topic: &str) -> Result<OutletIdentity, TopicError> {
    let malformed = |reason| TopicError::Malformed {
        topic: topic.to_string(),
        reason,
    };

    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 {
        return Err(malformed("expected 4 segments"));
    }
    if parts[0] != ROOT {
        return Err(malformed("does not start with 'power'"));
    }
    if parts[2] != OUTLETS {
        return Err(malformed("third segment is not 'outlets'"));
    }
    if parts[1].is_empty() || parts[3].is_empty() {
        return Err(malformed("empty device or outlet"));
    }

    Ok(OutletIdentity::new(parts[1], parts[3]))
}

/// Build the status topic for a device/outlet.
pub fn encode_status_topic(device: &str, outlet: &str) -> String {
    format!("{ROOT}/{device}/{OUTLETS}/{outlet}")
}

/// Build the command topic for a device/outlet.
///
/// Names are not escaped; a `/` inside `device` or `outlet` produces a
/// different topic shape.
pub fn encode_command_topic(device: &str, outlet: &str) -> String {
    format!("{ROOT}/{device}/{OUTLETS}/{outlet}/{SET_SUFFIX}")
}

/// Interpret a status payload: `0` is off, `1` is on, anything else is kept
/// verbatim after trimming.
pub fn decode_payload(payload: &str) -> OutletState {
    match payload.trim() {
        "0" => OutletState::Off,
        "1" => OutletState::On,
        other => OutletState::Other(other.to_string()),
    }
}

/// Turn a desired state (`ON` / `OFF`, any case) into a command payload.
/// Unknown states are sent upper-cased.
pub fn encode_payload(state: &str) -> String {
    let state = state.trim().to_uppercase();
    match state.as_str() {
        "ON" => "1".to_string(),
        "OFF" => "0".to_string(),
        _ => state,
    }
}
