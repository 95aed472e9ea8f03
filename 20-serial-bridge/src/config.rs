use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, ensure};

/// Port the bridge listens on when nothing else is configured.
pub const DEFAULT_LISTEN_PORT: u16 = 12345;
pub const DEFAULT_BAUD_RATE: u32 = 19200;
/// Outbound chunks a session may have queued before it is considered too slow.
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_DEVICE_QUEUE_CAPACITY: usize = 16;

/// Everything the bridge needs at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub device: DeviceConfig,
    pub session_queue_capacity: usize,
    pub device_queue_capacity: usize,
}

/// Serial port settings.
///
/// A zero `read_timeout` means reads block until the device produces data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            device,
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
            device_queue_capacity: DEFAULT_DEVICE_QUEUE_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Tokio's bounded channels refuse a capacity of zero.
        ensure!(
            self.session_queue_capacity > 0,
            "session queue capacity must be at least 1"
        );
        ensure!(
            self.device_queue_capacity > 0,
            "device queue capacity must be at least 1"
        );
        self.device.validate()
    }
}

impl DeviceConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.path.trim().is_empty(), "device path cannot be empty");
        ensure!(self.baud_rate > 0, "baud rate must be positive");
        Ok(())
    }

    pub fn blocks_until_data(&self) -> bool {
        self.read_timeout.is_zero()
    }
}
