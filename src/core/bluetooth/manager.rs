//! Device manager for the daemon
//! Owns the managed device roster, drives scan/connect cycles and fans services
//! out over every connected device.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::core::bluetooth::address::{AddressError, BdAddr};
use crate::core::bluetooth::device::Device;
use crate::core::bluetooth::managed_device::ManagedDevice;
use crate::core::bluetooth::transport::{Transport, TransportError};
use crate::core::bluetooth::types::{ConnectionState, Timeouts};
use crate::core::services::GattService;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error("the device {0} has already been added")]
    DuplicateDevice(BdAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("could not start scanning for BLE devices: {0}")]
    Start(TransportError),
    #[error("could not stop scanning for BLE devices: {0}")]
    Stop(TransportError),
}

/// Outcome of running one service over the roster
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRunReport {
    /// Connected devices the service ran on
    pub invoked: usize,
    /// Runs that reported failure
    pub failed: usize,
}

/// One roster entry as it appears in status log lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub device: Device,
    pub state: ConnectionState,
}

#[derive(Default)]
struct ScanState {
    /// Devices visible in the most recent discovery pass
    discovered: Vec<Device>,
    /// Whether the running discovery session is ours to stop
    started_discovery: bool,
}

/// Manages the roster of managed devices
pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    timeouts: Timeouts,
    scan_window: Duration,
    devices: Vec<ManagedDevice>,
    scan: Mutex<ScanState>,
}

impl DeviceManager {
    /// Creates a new DeviceManager with an empty roster
    pub fn new(transport: Arc<dyn Transport>, timeouts: Timeouts, scan_window: Duration) -> Self {
        Self {
            transport,
            timeouts,
            scan_window,
            devices: Vec::new(),
            scan: Mutex::new(ScanState::default()),
        }
    }

    /// Adds a device to the roster in disconnected state.
    pub fn add_managed_device(&mut self, address: &str) -> Result<(), RegistryError> {
        let address = match BdAddr::parse(address) {
            Ok(address) => address,
            Err(e) => {
                warn!("Not adding managed device: {}", e);
                return Err(e.into());
            }
        };

        if self.devices.iter().any(|d| d.address() == &address) {
            warn!("The device {} has already been added.", address);
            return Err(RegistryError::DuplicateDevice(address));
        }

        info!("Added managed device: {}", address);
        self.devices.push(ManagedDevice::new(
            address,
            Arc::clone(&self.transport),
            self.timeouts,
        ));
        Ok(())
    }

    pub fn managed_devices_count(&self) -> usize {
        self.devices.len()
    }

    pub fn managed_devices(&self) -> impl Iterator<Item = &ManagedDevice> {
        self.devices.iter()
    }

    /// Locally tracked state of every managed device, in roster order
    pub async fn roster_status(&self) -> Vec<DeviceStatus> {
        let mut roster = Vec::with_capacity(self.devices.len());
        for device in self.managed_devices() {
            roster.push(DeviceStatus {
                device: device.device().await,
                state: device.connection_state().await,
            });
        }
        roster
    }

    pub fn managed_device_by_index(&self, index: usize) -> Option<&ManagedDevice> {
        self.devices.get(index)
    }

    pub fn index_of_managed_device(&self, address: &str) -> Option<usize> {
        let address = BdAddr::parse(address).ok()?;
        self.devices.iter().position(|d| d.address() == &address)
    }

    pub fn managed_device_by_address(&self, address: &str) -> Option<&ManagedDevice> {
        self.index_of_managed_device(address)
            .and_then(|index| self.devices.get(index))
    }

    pub fn is_managed_device(&self, address: &str) -> bool {
        self.index_of_managed_device(address).is_some()
    }

    /// Disconnects and drops every managed device.
    pub async fn clear_managed_devices(&mut self) {
        for device in &self.devices {
            if let Err(e) = device.disconnect().await {
                error!("Teardown of device {} failed: {}", device.address(), e);
            }
        }
        self.devices.clear();
    }

    /// Ends a discovery session we started and tears the roster down.
    pub async fn shutdown(&mut self) {
        if self.scan.lock().await.started_discovery {
            if let Err(e) = self.stop_scan().await {
                warn!("{}", e);
            }
        }
        self.clear_managed_devices().await;
        info!("Device manager shut down.");
    }

    /// Resets the last pass and starts discovery unless another party already runs one.
    pub async fn start_scan(&self) -> Result<(), ScanError> {
        let mut scan = self.scan.lock().await;
        scan.discovered.clear();
        for device in &self.devices {
            device.set_discovered(false).await;
        }

        if self.transport.is_discovering().await {
            debug!("Discovery is already active, leaving it to whoever started it.");
            scan.started_discovery = false;
            return Ok(());
        }

        debug!("Starting device scan...");
        self.transport_call(self.transport.start_discovery())
            .await
            .map_err(ScanError::Start)?;
        scan.started_discovery = true;
        Ok(())
    }

    /// Stops the discovery we started, then records what the transport saw.
    pub async fn stop_scan(&self) -> Result<(), ScanError> {
        let mut scan = self.scan.lock().await;

        if scan.started_discovery {
            self.transport_call(self.transport.stop_discovery())
                .await
                .map_err(ScanError::Stop)?;
            scan.started_discovery = false;
            debug!("Device scan completed.");
        }

        for device in self.transport.discovered_devices().await {
            self.record_discovered(&device).await;
            scan.discovered.push(device);
        }
        Ok(())
    }

    /// One full discovery pass: start, wait out the scan window, stop.
    pub async fn scan(&self) -> Result<(), ScanError> {
        self.start_scan().await?;
        sleep(self.scan_window).await;
        self.stop_scan().await
    }

    /// Devices visible in the most recent pass, managed or not
    pub async fn discovered_devices(&self) -> Vec<Device> {
        self.scan.lock().await.discovered.clone()
    }

    /// Connects every managed device that is not connected and was seen by the last scan.
    ///
    /// Returns the number of devices that got connected.
    pub async fn connect_discovered_managed_devices(&self) -> usize {
        let mut connected = 0;
        for device in &self.devices {
            if device.is_connected().await {
                continue;
            }
            if !device.discovered().await {
                debug!("Managed device {} was not seen by the last scan.", device.address());
                continue;
            }
            if device.connect().await.is_ok() {
                connected += 1;
            }
        }
        connected
    }

    pub async fn all_managed_devices_connected(&self) -> bool {
        for device in &self.devices {
            if !device.is_connected().await {
                return false;
            }
        }
        true
    }

    /// Runs `service` once on every connected device, in roster order.
    pub async fn run_service(&self, service: &dyn GattService) -> ServiceRunReport {
        let mut report = ServiceRunReport::default();
        for device in &self.devices {
            if !device.is_connected().await {
                continue;
            }
            report.invoked += 1;
            if !service.run(device).await {
                report.failed += 1;
                warn!("Service {} failed on device {}.", service.name(), device.address());
            }
        }
        report
    }

    async fn record_discovered(&self, discovered: &Device) {
        match self.devices.iter().find(|d| d.address() == &discovered.address) {
            Some(device) => {
                if discovered.name.is_some() {
                    device.set_name(discovered.name.clone()).await;
                }
                device.set_discovered(true).await;
                info!("Discovered managed device {} ({}).", discovered.address, discovered.display_name());
            }
            None => {
                debug!("Discovered unmanaged device {} ({}).", discovered.address, discovered.display_name());
            }
        }
    }

    async fn transport_call<F>(&self, fut: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), TransportError>>,
    {
        tokio::time::timeout(self.timeouts.operation, fut)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock_transport::{MockTransport, TransportCall};
    use std::sync::Mutex as StdMutex;

    const WATCH_A: &str = "FB:89:02:47:5F:C6";
    const WATCH_B: &str = "D9:C7:C5:38:D0:CB";

    fn manager(transport: &Arc<MockTransport>) -> DeviceManager {
        let transport: Arc<dyn Transport> = transport.clone();
        DeviceManager::new(transport, Timeouts::default(), Duration::from_secs(4))
    }

    /// Records the devices it ran on and fails on the ones listed
    struct RecordingService {
        failing: Vec<BdAddr>,
        seen: StdMutex<Vec<BdAddr>>,
    }

    #[async_trait::async_trait]
    impl GattService for RecordingService {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(&self, device: &ManagedDevice) -> bool {
            self.seen.lock().unwrap().push(device.address().clone());
            !self.failing.contains(device.address())
        }
    }

    #[test]
    fn duplicate_addresses_are_rejected_case_insensitively() {
        let transport = Arc::new(MockTransport::new());
        let mut manager = manager(&transport);

        assert_eq!(manager.add_managed_device(WATCH_A), Ok(()));
        assert_eq!(
            manager.add_managed_device(&WATCH_A.to_lowercase()),
            Err(RegistryError::DuplicateDevice(BdAddr::parse(WATCH_A).unwrap()))
        );
        assert_eq!(manager.managed_devices_count(), 1);
        assert!(manager.is_managed_device("fb:89:02:47:5f:c6"));
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let transport = Arc::new(MockTransport::new());
        let mut manager = manager(&transport);

        assert!(matches!(
            manager.add_managed_device("FB:89:02:47:5F"),
            Err(RegistryError::InvalidAddress(_))
        ));
        assert_eq!(manager.managed_devices_count(), 0);
    }

    #[test]
    fn lookups_follow_insertion_order() {
        let transport = Arc::new(MockTransport::new());
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();
        manager.add_managed_device(WATCH_B).unwrap();

        assert_eq!(manager.index_of_managed_device(WATCH_B), Some(1));
        assert_eq!(
            manager.managed_device_by_index(0).map(|d| d.address().to_string()),
            Some(WATCH_A.to_string())
        );
        assert!(manager.managed_device_by_address("00:11:22:33:44:55").is_none());
        assert!(manager.managed_device_by_index(2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connects_only_devices_seen_by_the_last_scan() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, Some("InfiniTime"));
        transport.add_peer(WATCH_B, None);
        transport.set_visible(WATCH_B, false);
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();
        manager.add_managed_device(WATCH_B).unwrap();

        manager.scan().await.unwrap();
        assert_eq!(manager.connect_discovered_managed_devices().await, 1);

        assert_eq!(transport.connect_count(WATCH_A), 1);
        assert_eq!(transport.connect_count(WATCH_B), 0);
        assert_eq!(
            manager.managed_device_by_index(0).unwrap().name().await.as_deref(),
            Some("InfiniTime")
        );
        assert!(!manager.all_managed_devices_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_devices_are_not_reconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, None);
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();

        manager.scan().await.unwrap();
        manager.connect_discovered_managed_devices().await;
        manager.scan().await.unwrap();
        manager.connect_discovered_managed_devices().await;

        assert_eq!(transport.connect_count(WATCH_A), 1);
        assert!(manager.all_managed_devices_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn each_scan_resets_discovered_flags() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, None);
        transport.add_peer("00:11:22:33:44:55", Some("Headphones"));
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();

        manager.scan().await.unwrap();
        assert!(manager.managed_device_by_index(0).unwrap().discovered().await);
        // unmanaged devices are part of the pass too
        assert_eq!(manager.discovered_devices().await.len(), 2);

        transport.set_visible(WATCH_A, false);
        manager.scan().await.unwrap();
        assert!(!manager.managed_device_by_index(0).unwrap().discovered().await);
        assert_eq!(manager.discovered_devices().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_stop_discovery_started_elsewhere() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, None);
        transport.set_external_discovery(true);
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();

        manager.scan().await.unwrap();

        let calls = transport.calls();
        assert!(!calls.contains(&TransportCall::StartDiscovery));
        assert!(!calls.contains(&TransportCall::StopDiscovery));
        assert!(manager.managed_device_by_index(0).unwrap().discovered().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_discovery_it_started() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);

        manager.scan().await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![TransportCall::StartDiscovery, TransportCall::StopDiscovery]
        );
    }

    #[tokio::test]
    async fn run_service_without_connected_devices_does_nothing() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, None);
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();
        let service = RecordingService {
            failing: Vec::new(),
            seen: StdMutex::new(Vec::new()),
        };

        let report = manager.run_service(&service).await;

        assert_eq!(report, ServiceRunReport::default());
        assert!(service.seen.lock().unwrap().is_empty());
        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_service_continues_after_a_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, None);
        transport.add_peer(WATCH_B, None);
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();
        manager.add_managed_device(WATCH_B).unwrap();
        manager.scan().await.unwrap();
        manager.connect_discovered_managed_devices().await;

        let a = BdAddr::parse(WATCH_A).unwrap();
        let b = BdAddr::parse(WATCH_B).unwrap();
        let service = RecordingService {
            failing: vec![a.clone()],
            seen: StdMutex::new(Vec::new()),
        };

        let report = manager.run_service(&service).await;

        assert_eq!(report, ServiceRunReport { invoked: 2, failed: 1 });
        assert_eq!(*service.seen.lock().unwrap(), vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn roster_status_reports_names_and_connections() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, Some("InfiniTime"));
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();
        manager.add_managed_device(WATCH_B).unwrap();
        manager.scan().await.unwrap();
        manager.connect_discovered_managed_devices().await;

        let roster = manager.roster_status().await;
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].device.name.as_deref(), Some("InfiniTime"));
        assert_eq!(roster[0].state, ConnectionState::Connected);
        assert_eq!(roster[1].state, ConnectionState::Disconnected);

        assert_eq!(
            serde_json::to_string(&roster).unwrap(),
            format!(
                r#"[{{"address":"{}","name":"InfiniTime","state":"connected"}},{{"address":"{}","name":null,"state":"disconnected"}}]"#,
                WATCH_A, WATCH_B
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_everything() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peer(WATCH_A, None);
        let mut manager = manager(&transport);
        manager.add_managed_device(WATCH_A).unwrap();
        manager.scan().await.unwrap();
        manager.connect_discovered_managed_devices().await;

        manager.shutdown().await;

        assert_eq!(manager.managed_devices_count(), 0);
        assert!(transport
            .calls()
            .contains(&TransportCall::Disconnect(WATCH_A.to_string())));
    }
}
