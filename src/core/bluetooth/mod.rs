//! Bluetooth functionality for the PineConnect daemon
//! This module handles device addresses, the transport seam to the host
//! Bluetooth stack, managed device connections and the device roster.

pub mod address;
mod bluest_transport;
mod constants;
mod device;
mod managed_device;
mod manager;
#[cfg(test)]
pub(crate) mod mock_transport;
mod scanner;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use address::{BdAddr, AddressError};
pub use bluest_transport::BluestTransport;
pub use constants::*; // Re-export all constants
pub use device::Device;
pub use managed_device::{DeviceError, ManagedDevice};
pub use manager::{DeviceManager, DeviceStatus, RegistryError, ScanError, ServiceRunReport};
pub use transport::{Transport, TransportError};
pub use types::{CharacteristicLocator, ConnectionState, DisconnectEvent, Timeouts};
