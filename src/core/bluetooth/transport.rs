//! Transport binding seam
//! Everything the connection core needs from the host's Bluetooth stack.

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::address::BdAddr;
use crate::core::bluetooth::device::Device;
use crate::core::bluetooth::types::{CharacteristicLocator, DisconnectEvent};

/// Failures reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No adapter or no connection to the Bluetooth service
    #[error("bluetooth transport unavailable")]
    Unavailable,
    /// The device, service or characteristic does not exist (any more)
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Failed(String),
}

impl TransportError {
    /// True for failures that the disconnect-on-failure policy treats as "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Access to the host Bluetooth stack, keyed by device address.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Whether the adapter is present and powered on
    async fn adapter_powered(&self) -> bool;

    async fn is_discovering(&self) -> bool;
    async fn start_discovery(&self) -> Result<(), TransportError>;

    /// Stops discovery and refreshes the list returned by `discovered_devices`
    async fn stop_discovery(&self) -> Result<(), TransportError>;

    /// Devices visible after the last discovery refresh
    async fn discovered_devices(&self) -> Vec<Device>;

    async fn is_device_connected(&self, address: &BdAddr) -> bool;

    /// Connects; with `verify` the call only succeeds once the link reports connected
    async fn connect_device(&self, address: &BdAddr, verify: bool) -> Result<(), TransportError>;

    /// Disconnects; with `verify` the call only succeeds once the link reports disconnected
    async fn disconnect_device(&self, address: &BdAddr, verify: bool) -> Result<(), TransportError>;

    async fn find_characteristic(
        &self,
        address: &BdAddr,
        uuid: Uuid,
    ) -> Result<CharacteristicLocator, TransportError>;

    /// Reads at most `max_len` bytes
    async fn read_characteristic(
        &self,
        locator: &CharacteristicLocator,
        max_len: usize,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write_characteristic(
        &self,
        locator: &CharacteristicLocator,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribes to link-loss events of one device
    async fn watch_disconnects(
        &self,
        address: &BdAddr,
    ) -> Result<mpsc::UnboundedReceiver<DisconnectEvent>, TransportError>;
}
