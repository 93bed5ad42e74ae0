//! Applies monitor results to the device list

use super::monitor::MonitorListener;
use super::reconcile::DeviceSnapshot;
use crate::client::ClientSession;
use crate::core::types::DeviceChange;
use crate::devices::DeviceInfo;
use crate::engine::Shared;
use crate::error::Error;
use crate::tracking::tracker;
use std::sync::Arc;

pub(crate) struct DeviceUpdater {
    shared: Arc<Shared>,
}

impl DeviceUpdater {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn disconnect(&self, device: &DeviceInfo, sessions: Vec<Arc<ClientSession>>) {
        for session in sessions {
            session.drop_session(false);
        }
        log::info!("Device disconnected: {}", device.serial);
        self.shared.listeners.device_disconnected(device);
    }

    fn device_online(&self, serial: &str) {
        if self.shared.config.clients.enabled
            && let Err(e) = tracker::start_monitoring_device(&self.shared, serial)
        {
            log::warn!("{}: cannot track clients: {}", serial, e);
        }

        if !crate::adb::emulator::is_emulator(serial) {
            return;
        }
        let Some(console) = &self.shared.collaborators.emulator_console else {
            return;
        };
        if let Some(name) = console.avd_name(serial)
            && let Some(info) = self.shared.devices.set_name(serial, name)
        {
            self.shared.listeners.device_changed(&info, DeviceChange::Name);
        }
    }
}

impl MonitorListener for DeviceUpdater {
    fn connection_error(&self, error: &Error) {
        log::debug!("Clearing device list after: {}", error);
        for (device, sessions) in self.shared.devices.remove_all() {
            self.disconnect(&device, sessions);
        }
    }

    fn device_list_update(&self, snapshot: DeviceSnapshot) {
        let changes = self.shared.devices.update(&snapshot);

        for (device, sessions) in changes.disconnected {
            self.disconnect(&device, sessions);
        }
        for device in &changes.changed {
            log::info!("Device {} is now {}", device.serial, device.state.as_str());
            self.shared.listeners.device_changed(device, DeviceChange::State);
        }
        for device in &changes.connected {
            log::info!("Device connected: {} ({})", device.serial, device.state.as_str());
            self.shared.listeners.device_connected(device);
        }
        for serial in &changes.newly_online {
            self.device_online(serial);
        }
    }
}
