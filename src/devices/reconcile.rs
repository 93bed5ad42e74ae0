//! Device snapshot parsing and reconciliation
//!
//! Devices are compared by serial only. The result is three unordered
//! collections; callers must not rely on their iteration order.

use crate::core::types::DeviceState;
use std::collections::BTreeMap;

/// One `host:track-devices` block: serial to state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    entries: BTreeMap<String, DeviceState>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `serial\tstate` lines
    ///
    /// Lines without exactly two tab-separated fields are ignored. An unknown
    /// state keeps the device, recorded as offline.
    pub fn parse(text: &str) -> Self {
        let mut snapshot = Self::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 2 || fields[0].is_empty() {
                continue;
            }
            let state = DeviceState::from_bridge(fields[1]).unwrap_or_else(|| {
                log::debug!("Unknown state {:?} for {}, treating as offline", fields[1], fields[0]);
                DeviceState::Offline
            });
            snapshot.insert(fields[0], state);
        }
        snapshot
    }

    pub fn insert(&mut self, serial: impl Into<String>, state: DeviceState) {
        self.entries.insert(serial.into(), state);
    }

    pub fn get(&self, serial: &str) -> Option<DeviceState> {
        self.entries.get(serial).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DeviceState)> {
        self.entries.iter().map(|(serial, state)| (serial.as_str(), *state))
    }
}

impl<S: Into<String>> FromIterator<(S, DeviceState)> for DeviceSnapshot {
    fn from_iter<T: IntoIterator<Item = (S, DeviceState)>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for (serial, state) in iter {
            snapshot.insert(serial, state);
        }
        snapshot
    }
}

/// Difference between the known devices and a new snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub added: Vec<(String, DeviceState)>,
    pub removed: Vec<String>,
    /// Known devices whose state changed, with the new state
    pub updated: Vec<(String, DeviceState)>,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Compare `previous` (serial, state) pairs against `next`
pub fn reconcile<'a, I>(previous: I, next: &DeviceSnapshot) -> ReconciliationResult
where
    I: IntoIterator<Item = (&'a str, DeviceState)>,
{
    let mut remaining = next.entries.clone();
    let mut result = ReconciliationResult::default();

    for (serial, state) in previous {
        match remaining.remove(serial) {
            None => result.removed.push(serial.to_string()),
            Some(new_state) if new_state != state => {
                result.updated.push((serial.to_string(), new_state));
            }
            Some(_) => {}
        }
    }

    result.added = remaining.into_iter().collect();
    result
}
