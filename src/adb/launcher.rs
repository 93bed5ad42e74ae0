//! Daemon restart through the `adb` executable

use crate::core::listener::BridgeLauncher;
use std::process::{Command, Stdio};

/// Restarts the daemon with `<adb> start-server`
pub struct AdbServerLauncher {
    adb_path: String,
}

impl AdbServerLauncher {
    pub fn new(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }
}

impl BridgeLauncher for AdbServerLauncher {
    fn restart(&self) -> bool {
        log::info!("Restarting bridge daemon: {} start-server", self.adb_path);
        match Command::new(&self.adb_path)
            .arg("start-server")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                log::error!(
                    "'{} start-server' failed ({}): {}",
                    self.adb_path,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                log::error!("Unable to run '{}': {}", self.adb_path, e);
                false
            }
        }
    }
}
