//! Defines shared data structures for the Bluetooth module.

use std::time::Duration;

use uuid::Uuid;

use crate::core::bluetooth::address::BdAddr;
use crate::core::bluetooth::constants::{
    CONNECT_TIMEOUT_MS, DEFAULT_OPERATION_TIMEOUT_MS, DISCONNECT_TIMEOUT_MS,
};

/// Connection state of a managed device
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Identifies one characteristic on one device.
///
/// Resolved by the transport from a UUID; only valid for the connection it was resolved on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicLocator {
    device: BdAddr,
    uuid: Uuid,
}

impl CharacteristicLocator {
    pub fn new(device: BdAddr, uuid: Uuid) -> Self {
        Self { device, uuid }
    }

    pub fn device(&self) -> &BdAddr {
        &self.device
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Object-path style rendering used in log lines
    pub fn path(&self, hci: &str) -> String {
        format!("/org/bluez/{}/{}/char/{}", hci, self.device.to_object_name(), self.uuid)
    }
}

/// Signals that the link to a device has been lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub address: BdAddr,
}

/// Per-operation timeouts applied around transport calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub disconnect: Duration,
    pub operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(CONNECT_TIMEOUT_MS),
            disconnect: Duration::from_millis(DISCONNECT_TIMEOUT_MS),
            operation: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }
}
