//! Transport backed by the host Bluetooth stack through `bluest`
//! (BlueZ on Linux, CoreBluetooth on macOS, WinRT on Windows).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::core::bluetooth::address::{extract_mac_address, BdAddr};
use crate::core::bluetooth::device::Device;
use crate::core::bluetooth::scanner::{lock, BluetoothScanner, DeviceCache};
use crate::core::bluetooth::transport::{Transport, TransportError};
use crate::core::bluetooth::types::{CharacteristicLocator, DisconnectEvent};

type CharacteristicCache = Arc<Mutex<HashMap<CharacteristicLocator, Characteristic>>>;

/// Maps a `bluest` failure onto the transport taxonomy
pub fn map_error(e: bluest::Error) -> TransportError {
    match e.kind() {
        ErrorKind::NotFound => TransportError::NotFound(e.to_string()),
        ErrorKind::AdapterUnavailable => TransportError::Unavailable,
        ErrorKind::Timeout => TransportError::Timeout,
        _ => TransportError::Failed(e.to_string()),
    }
}

pub struct BluestTransport {
    /// Adapter name used when rendering object paths in logs
    hci: String,
    /// Opened on first use; stays empty while no adapter is present
    adapter: AsyncMutex<Option<Adapter>>,
    scanner: AsyncMutex<BluetoothScanner>,
    /// Every device object seen so far, needed to connect by address
    known: DeviceCache,
    /// Snapshot taken when discovery stopped
    visible: Mutex<Vec<Device>>,
    characteristics: CharacteristicCache,
}

impl BluestTransport {
    pub fn new(hci: impl Into<String>) -> Self {
        Self {
            hci: hci.into(),
            adapter: AsyncMutex::new(None),
            scanner: AsyncMutex::new(BluetoothScanner::new(Arc::new(Mutex::new(HashMap::new())))),
            known: Arc::new(Mutex::new(HashMap::new())),
            visible: Mutex::new(Vec::new()),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn adapter(&self) -> Result<Adapter, TransportError> {
        let mut guard = self.adapter.lock().await;
        if let Some(adapter) = guard.as_ref() {
            return Ok(adapter.clone());
        }

        let adapter = Adapter::default().await.ok_or_else(|| {
            debug!("No Bluetooth adapter found");
            TransportError::Unavailable
        })?;
        info!("Bluetooth adapter opened.");
        *guard = Some(adapter.clone());
        Ok(adapter)
    }

    /// Looks up the device object of `address`, falling back to the adapter's connected devices
    async fn device(&self, address: &BdAddr) -> Result<bluest::Device, TransportError> {
        if let Some(device) = lock(&self.known).get(address).cloned() {
            return Ok(device);
        }

        let adapter = self.adapter().await?;
        for device in adapter.connected_devices().await.map_err(map_error)? {
            if extract_mac_address(&device.id().to_string()).as_ref() == Some(address) {
                lock(&self.known).insert(address.clone(), device.clone());
                return Ok(device);
            }
        }
        Err(TransportError::NotFound(format!("device {}", address)))
    }

    fn forget_characteristics(&self, address: &BdAddr) {
        lock(&self.characteristics).retain(|locator, _| locator.device() != address);
    }

    fn characteristic(&self, locator: &CharacteristicLocator) -> Result<Characteristic, TransportError> {
        lock(&self.characteristics)
            .get(locator)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(locator.path(&self.hci)))
    }
}

#[async_trait::async_trait]
impl Transport for BluestTransport {
    async fn adapter_powered(&self) -> bool {
        match self.adapter().await {
            Ok(adapter) => adapter.is_available().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn is_discovering(&self) -> bool {
        self.scanner.lock().await.is_scanning()
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;
        self.scanner.lock().await.start_scan(adapter).await
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        let mut scanner = self.scanner.lock().await;
        scanner.stop_scan().await;

        let mut seen: HashMap<BdAddr, bluest::Device> = scanner.devices().into_iter().collect();
        // connected peers stop advertising but are still around
        let adapter = self.adapter().await?;
        match adapter.connected_devices().await {
            Ok(connected) => {
                for device in connected {
                    if let Some(address) = extract_mac_address(&device.id().to_string()) {
                        seen.entry(address).or_insert(device);
                    }
                }
            }
            Err(e) => warn!("Could not list connected devices: {}", e),
        }

        let mut snapshot: Vec<Device> = seen
            .iter()
            .map(|(address, device)| Device::new(address.clone(), device.name().ok()))
            .collect();
        snapshot.sort_by(|a, b| a.address.cmp(&b.address));

        lock(&self.known).extend(seen);
        *lock(&self.visible) = snapshot;
        Ok(())
    }

    async fn discovered_devices(&self) -> Vec<Device> {
        lock(&self.visible).clone()
    }

    async fn is_device_connected(&self, address: &BdAddr) -> bool {
        let device = lock(&self.known).get(address).cloned();
        match device {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }

    async fn connect_device(&self, address: &BdAddr, verify: bool) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;
        let device = self.device(address).await?;

        self.forget_characteristics(address);
        adapter.connect_device(&device).await.map_err(map_error)?;

        if verify && !device.is_connected().await {
            return Err(TransportError::Failed(format!(
                "device {} did not report a connection",
                address
            )));
        }
        Ok(())
    }

    async fn disconnect_device(&self, address: &BdAddr, verify: bool) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;
        let device = self.device(address).await?;

        self.forget_characteristics(address);
        adapter.disconnect_device(&device).await.map_err(map_error)?;

        if verify && device.is_connected().await {
            return Err(TransportError::Failed(format!(
                "device {} is still connected",
                address
            )));
        }
        Ok(())
    }

    async fn find_characteristic(
        &self,
        address: &BdAddr,
        uuid: Uuid,
    ) -> Result<CharacteristicLocator, TransportError> {
        let locator = CharacteristicLocator::new(address.clone(), uuid);
        if lock(&self.characteristics).contains_key(&locator) {
            return Ok(locator);
        }

        let device = self.device(address).await?;
        if !device.is_connected().await {
            return Err(TransportError::Failed("Not connected".to_string()));
        }

        for service in device.services().await.map_err(map_error)? {
            for characteristic in service.characteristics().await.map_err(map_error)? {
                if characteristic.uuid() == uuid {
                    debug!(
                        "Found GATT characteristic {} in service {}.",
                        locator.path(&self.hci),
                        service.uuid()
                    );
                    lock(&self.characteristics).insert(locator.clone(), characteristic);
                    return Ok(locator);
                }
            }
        }
        Err(TransportError::NotFound(locator.path(&self.hci)))
    }

    async fn read_characteristic(
        &self,
        locator: &CharacteristicLocator,
        max_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(locator)?;
        let mut value = characteristic.read().await.map_err(map_error)?;
        value.truncate(max_len);
        Ok(value)
    }

    async fn write_characteristic(
        &self,
        locator: &CharacteristicLocator,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(locator)?;
        characteristic.write(data).await.map_err(map_error)
    }

    async fn watch_disconnects(
        &self,
        address: &BdAddr,
    ) -> Result<mpsc::UnboundedReceiver<DisconnectEvent>, TransportError> {
        let adapter = self.adapter().await?;
        let device = self.device(address).await?;
        let characteristics = self.characteristics.clone();
        let address = address.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    error!("Could not subscribe to connection events of device {}: {}", address, e);
                    return;
                }
            };

            loop {
                tokio::select! {
                    event = events.next() => {
                        match event {
                            Some(ConnectionEvent::Disconnected) => {
                                lock(&characteristics).retain(|locator, _| locator.device() != &address);
                                let _ = tx.send(DisconnectEvent { address: address.clone() });
                                break;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }
}
