//! Latest observed state per outlet

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::topic::{OutletIdentity, OutletState};

/// One outlet as last reported by its device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletRecord {
    #[serde(flatten)]
    pub identity: OutletIdentity,
    pub state: OutletState,
    pub last_update: DateTime<Utc>,
}

/// Map of outlet identity to its latest record.
///
/// Reads return owned snapshots sorted by `(device, outlet)`.
#[derive(Debug, Default)]
pub struct DeviceStore {
    outlets: RwLock<HashMap<OutletIdentity, OutletRecord>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `identity`, stamped with the current
    /// time. Returns the stored record.
    pub fn upsert(&self, identity: OutletIdentity, state: OutletState) -> OutletRecord {
        let record = OutletRecord {
            identity: identity.clone(),
            state,
            last_update: Utc::now(),
        };
        self.outlets.write().insert(identity, record.clone());
        record
    }

    pub fn get(&self, identity: &OutletIdentity) -> Option<OutletRecord> {
        self.outlets.read().get(identity).cloned()
    }

    /// All records, sorted by device name then outlet number
    pub fn all(&self) -> Vec<OutletRecord> {
        let mut records: Vec<_> = self.outlets.read().values().cloned().collect();
        sort_records(&mut records);
        records
    }

    /// Records whose device name, outlet number or state contains `needle`
    /// (case-insensitive). An empty needle matches everything.
    pub fn filter(&self, needle: &str) -> Vec<OutletRecord> {
        if needle.is_empty() {
            return self.all();
        }

        let needle = needle.to_lowercase();
        let mut records: Vec<_> = self
            .outlets
            .read()
            .values()
            .filter(|r| matches(r, &needle))
            .cloned()
            .collect();
        sort_records(&mut records);
        records
    }

    pub fn len(&self) -> usize {
        self.outlets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outlets.read().is_empty()
    }

    pub fn clear(&self) {
        self.outlets.write().clear();
    }
}

fn matches(record: &OutletRecord, needle: &str) -> bool {
    [
        record.identity.device_name.as_str(),
        record.identity.outlet_number.as_str(),
        record.state.as_str(),
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(needle))
}

fn sort_records(records: &mut [OutletRecord]) {
    records.sort_by(|a, b| a.identity.cmp(&b.identity));
}
