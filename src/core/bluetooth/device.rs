//! Bluetooth device representation and related functionality

use crate::core::bluetooth::address::BdAddr;

/// A peer seen by the adapter: its address and the name it advertised, if any
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Device {
    /// The address of the device, the natural key of every device list
    pub address: BdAddr,
    /// The name of the device, if available
    pub name: Option<String>,
}

impl Device {
    /// Creates a new Device instance
    pub fn new(address: BdAddr, name: Option<String>) -> Self {
        Self { address, name }
    }

    /// Name for log lines, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.address.as_str())
    }
}
