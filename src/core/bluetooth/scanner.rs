use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::address::{extract_mac_address, BdAddr};
use crate::core::bluetooth::bluest_transport::map_error;
use crate::core::bluetooth::transport::TransportError;

pub type DeviceCache = Arc<Mutex<HashMap<BdAddr, Device>>>;

/// Background discovery session filling a device cache while it runs
pub struct BluetoothScanner {
    devices: DeviceCache,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(devices: DeviceCache) -> Self {
        Self {
            devices,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Clears the cache and starts a new scan task
    pub async fn start_scan(&mut self, adapter: Adapter) -> Result<(), TransportError> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }
        lock(&self.devices).clear();

        self.cancel_token = CancellationToken::new();
        let cancel_token_for_task = self.cancel_token.clone();
        let devices_for_task = self.devices.clone();

        // the task reports whether the scan stream could be opened
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            Self::internal_scan_task(adapter, devices_for_task, cancel_token_for_task, started_tx).await;
        });
        self.scan_task_handle = Some(handle);

        match started_rx.await {
            Ok(Ok(())) => {
                info!("Device scan task started.");
                Ok(())
            }
            Ok(Err(e)) => {
                self.scan_task_handle = None;
                Err(e)
            }
            Err(_) => {
                self.scan_task_handle = None;
                Err(TransportError::Failed("scan task ended before starting".to_string()))
            }
        }
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceCache,
        cancel_token: CancellationToken,
        started: tokio::sync::oneshot::Sender<Result<(), TransportError>>,
    ) {
        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => {
                let _ = started.send(Ok(()));
                stream
            }
            Err(e) => {
                error!("Could not start scanning for BLE devices: {}", e);
                let _ = started.send(Err(map_error(e)));
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            let id = device.id().to_string();
                            match extract_mac_address(&id) {
                                Some(address) => {
                                    debug!("Found device - Address: {}, RSSI: {:?}", address, discovered.rssi);
                                    lock(&devices).insert(address, device);
                                }
                                None => debug!("Ignoring device without an address in its id: {}", id),
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Cancels the scan task and waits for it to finish
    pub async fn stop_scan(&mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            debug!("Waiting for scan task to finish...");
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }

    /// Devices seen by the current or latest scan
    pub fn devices(&self) -> Vec<(BdAddr, Device)> {
        lock(&self.devices)
            .iter()
            .map(|(address, device)| (address.clone(), device.clone()))
            .collect()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
