//! Connection lifecycle of one managed device
//! Connects, disconnects and reads/writes characteristics while keeping the
//! connection handle and the reported state in step.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::bluetooth::address::BdAddr;
use crate::core::bluetooth::device::Device;
use crate::core::bluetooth::transport::{Transport, TransportError};
use crate::core::bluetooth::types::{
    CharacteristicLocator, ConnectionState, DisconnectEvent, Timeouts,
};

/// Failures of a managed device operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device {0} is not connected")]
    NotConnected(BdAddr),
    #[error("characteristic {uuid} not found on device {address}")]
    CharacteristicNotFound { address: BdAddr, uuid: Uuid },
    #[error("device {address}: {source}")]
    Transport {
        address: BdAddr,
        #[source]
        source: TransportError,
    },
}

/// The live connection handle. Exists exactly while the device is connected.
struct Session {
    id: u64,
    /// Task consuming link-loss events for this connection
    watcher: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

struct DeviceState {
    name: Option<String>,
    /// Set by the latest scan pass, cleared before every scan and on disconnect
    discovered: bool,
    session: Option<Session>,
}

impl DeviceState {
    fn connection_state(&self) -> ConnectionState {
        if self.session.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Drops the connection handle. Returns true if there was one.
    fn release(&mut self) -> bool {
        self.discovered = false;
        self.session.take().is_some()
    }
}

/// A statically configured peer whose connection the daemon maintains.
///
/// Every operation runs under one per-device lock, which the link-loss watcher
/// takes as well, so foreground calls and disconnect events never interleave.
pub struct ManagedDevice {
    address: BdAddr,
    transport: Arc<dyn Transport>,
    timeouts: Timeouts,
    state: Arc<Mutex<DeviceState>>,
    next_session_id: AtomicU64,
}

impl ManagedDevice {
    pub fn new(address: BdAddr, transport: Arc<dyn Transport>, timeouts: Timeouts) -> Self {
        Self {
            address,
            transport,
            timeouts,
            state: Arc::new(Mutex::new(DeviceState {
                name: None,
                discovered: false,
                session: None,
            })),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn address(&self) -> &BdAddr {
        &self.address
    }

    pub async fn name(&self) -> Option<String> {
        self.state.lock().await.name.clone()
    }

    pub async fn set_name(&self, name: Option<String>) {
        self.state.lock().await.name = name;
    }

    pub async fn discovered(&self) -> bool {
        self.state.lock().await.discovered
    }

    pub async fn set_discovered(&self, discovered: bool) {
        self.state.lock().await.discovered = discovered;
    }

    /// Locally tracked state, without asking the transport
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection_state()
    }

    /// Snapshot of the passive device record
    pub async fn device(&self) -> Device {
        Device::new(self.address.clone(), self.name().await)
    }

    /// Checks the local handle, then the transport.
    ///
    /// A handle whose link the transport no longer reports is released here.
    pub async fn is_connected(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.session.is_none() {
            return false;
        }

        let alive = tokio::time::timeout(
            self.timeouts.operation,
            self.transport.is_device_connected(&self.address),
        )
        .await
        .unwrap_or(false);

        if !alive {
            info!("Device {} is no longer connected, releasing its connection.", self.address);
            state.release();
        }
        alive
    }

    /// Connects once, without retrying. Retries are up to the caller's next cycle.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().await;

        if state.session.is_some() {
            let alive = tokio::time::timeout(
                self.timeouts.operation,
                self.transport.is_device_connected(&self.address),
            )
            .await
            .unwrap_or(false);
            if alive {
                debug!("Device {} is already connected.", self.address);
                return Ok(());
            }
        }
        state.session = None;

        info!("Connecting to device {}...", self.address);
        let result = with_timeout(
            self.timeouts.connect,
            self.transport.connect_device(&self.address, true),
        )
        .await;

        if let Err(e) = result {
            warn!("Could not connect to device {}: {}", self.address, e);
            return Err(self.transport_error(e));
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let subscription = with_timeout(
            self.timeouts.operation,
            self.transport.watch_disconnects(&self.address),
        )
        .await;
        let watcher = match subscription {
            Ok(events) => Some(self.spawn_disconnect_watcher(id, events)),
            Err(e) => {
                warn!(
                    "Could not watch for disconnects of device {}: {}. Link loss will be noticed on the next operation.",
                    self.address, e
                );
                None
            }
        };
        state.session = Some(Session { id, watcher });

        info!("Connected to device {}.", self.address);
        Ok(())
    }

    /// Disconnects. Calling it while already disconnected succeeds without doing anything.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().await;

        if state.session.is_none() {
            state.discovered = false;
            debug!("Device {} is not connected, nothing to disconnect.", self.address);
            return Ok(());
        }

        info!("Disconnecting device {}...", self.address);
        let result = with_timeout(
            self.timeouts.disconnect,
            self.transport.disconnect_device(&self.address, true),
        )
        .await;

        match result {
            Ok(()) => {
                state.release();
                info!("Disconnected device {}.", self.address);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                state.release();
                info!("Device {} is gone, considering it disconnected.", self.address);
                Ok(())
            }
            Err(e) => {
                warn!("Could not disconnect device {}: {}", self.address, e);
                Err(self.transport_error(e))
            }
        }
    }

    /// Reads up to `max_len` bytes, closing the connection on any failure.
    pub async fn read_characteristic(&self, uuid: Uuid, max_len: usize) -> Result<Vec<u8>, DeviceError> {
        self.read_characteristic_with_policy(uuid, max_len, true).await
    }

    /// Reads up to `max_len` bytes.
    ///
    /// With `disconnect_on_failure` unset, a characteristic that cannot be found
    /// leaves the connection as it was. Any other failure always releases it.
    pub async fn read_characteristic_with_policy(
        &self,
        uuid: Uuid,
        max_len: usize,
        disconnect_on_failure: bool,
    ) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.state.lock().await;
        let locator = self.locate(&mut state, uuid, disconnect_on_failure).await?;

        let result = with_timeout(
            self.timeouts.operation,
            self.transport.read_characteristic(&locator, max_len),
        )
        .await;

        match result {
            Ok(mut data) => {
                data.truncate(max_len);
                debug!(
                    "Read {} bytes from GATT characteristic {} on device {}.",
                    data.len(),
                    uuid,
                    self.address
                );
                Ok(data)
            }
            Err(e) => {
                error!(
                    "Error while reading from GATT characteristic {} on device {}: {}",
                    uuid, self.address, e
                );
                Err(self.fail(&mut state, uuid, e, disconnect_on_failure).await)
            }
        }
    }

    /// Writes `data`, closing the connection on any failure.
    pub async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<(), DeviceError> {
        self.write_characteristic_with_policy(uuid, data, true).await
    }

    /// Writes `data` with the same failure policy as reads.
    pub async fn write_characteristic_with_policy(
        &self,
        uuid: Uuid,
        data: &[u8],
        disconnect_on_failure: bool,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().await;
        let locator = self.locate(&mut state, uuid, disconnect_on_failure).await?;

        let result = with_timeout(
            self.timeouts.operation,
            self.transport.write_characteristic(&locator, data),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(
                    "Wrote {} bytes to GATT characteristic {} on device {}.",
                    data.len(),
                    uuid,
                    self.address
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "Error while writing to GATT characteristic {} on device {}: {}",
                    uuid, self.address, e
                );
                Err(self.fail(&mut state, uuid, e, disconnect_on_failure).await)
            }
        }
    }

    async fn locate(
        &self,
        state: &mut DeviceState,
        uuid: Uuid,
        disconnect_on_failure: bool,
    ) -> Result<CharacteristicLocator, DeviceError> {
        if state.session.is_none() {
            return Err(DeviceError::NotConnected(self.address.clone()));
        }

        match with_timeout(
            self.timeouts.operation,
            self.transport.find_characteristic(&self.address, uuid),
        )
        .await
        {
            Ok(locator) => Ok(locator),
            Err(e) => {
                warn!(
                    "Could not find GATT characteristic {} on device {}: {}",
                    uuid, self.address, e
                );
                Err(self.fail(state, uuid, e, disconnect_on_failure).await)
            }
        }
    }

    /// Applies the disconnect-on-failure policy and builds the error for the caller.
    async fn fail(
        &self,
        state: &mut DeviceState,
        uuid: Uuid,
        error: TransportError,
        disconnect_on_failure: bool,
    ) -> DeviceError {
        if error.is_not_found() {
            if disconnect_on_failure {
                warn!(
                    "Closing the connection to device {} after characteristic {} went missing.",
                    self.address, uuid
                );
                self.force_close(state).await;
            }
            return DeviceError::CharacteristicNotFound {
                address: self.address.clone(),
                uuid,
            };
        }

        warn!("Connection to device {} is considered lost: {}", self.address, error);
        state.release();
        self.transport_error(error)
    }

    /// Best-effort disconnect followed by releasing the handle, whatever the transport says.
    async fn force_close(&self, state: &mut DeviceState) {
        if let Err(e) = with_timeout(
            self.timeouts.disconnect,
            self.transport.disconnect_device(&self.address, false),
        )
        .await
        {
            debug!("Forced disconnect of device {} reported: {}", self.address, e);
        }
        state.release();
    }

    fn transport_error(&self, source: TransportError) -> DeviceError {
        DeviceError::Transport {
            address: self.address.clone(),
            source,
        }
    }

    fn spawn_disconnect_watcher(
        &self,
        session_id: u64,
        mut events: mpsc::UnboundedReceiver<DisconnectEvent>,
    ) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let address = self.address.clone();

        tokio::spawn(async move {
            if events.recv().await.is_none() {
                debug!("Disconnect events of device {} ended.", address);
                return;
            }

            let mut state = state.lock().await;
            // a reconnect may have replaced the session this watcher belongs to
            if state.session.as_ref().map(|s| s.id) == Some(session_id) {
                info!("Device {} disconnected.", address);
                state.release();
            }
        })
    }
}

impl Drop for ManagedDevice {
    fn drop(&mut self) {
        // stop the watcher, it holds a reference to our state
        if let Ok(mut state) = self.state.try_lock() {
            state.session.take();
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(TransportError::Timeout))
}
