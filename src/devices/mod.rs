//! Device discovery and the device list
//!
//! The monitor reports raw device lists; the updater reconciles them into
//! the shared [`DeviceList`] and starts client tracking on online devices.

pub mod device;
pub mod monitor;
pub mod reconcile;
pub(crate) mod updater;

pub use device::{AppliedChanges, DeviceInfo, DeviceList};
pub use monitor::{DeviceMonitor, MonitorListener};
pub use reconcile::{DeviceSnapshot, ReconciliationResult, reconcile};
