//! Scripted in-memory transport for unit tests.
//! Records every call and lets tests inject failures and link loss.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::address::BdAddr;
use crate::core::bluetooth::device::Device;
use crate::core::bluetooth::transport::{Transport, TransportError};
use crate::core::bluetooth::types::{CharacteristicLocator, DisconnectEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartDiscovery,
    StopDiscovery,
    Connect(String),
    Disconnect(String),
    Find(String, Uuid),
    Read(String, Uuid),
    Write(String, Uuid, Vec<u8>),
}

struct Peer {
    address: BdAddr,
    name: Option<String>,
    visible: bool,
    connected: bool,
    hang_connect: bool,
    hang_link_checks: bool,
    hang_watch: bool,
    connect_error: Option<TransportError>,
    values: HashMap<Uuid, Vec<u8>>,
    io_errors: HashMap<Uuid, TransportError>,
    subscribers: Vec<mpsc::UnboundedSender<DisconnectEvent>>,
}

struct MockState {
    powered: bool,
    discovering: bool,
    external_discovery: bool,
    peers: Vec<Peer>,
    calls: Vec<TransportCall>,
}

impl MockState {
    fn peer(&mut self, address: &BdAddr) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| &p.address == address)
    }

    fn peer_mut(&mut self, address: &str) -> &mut Peer {
        let address = BdAddr::parse(address).expect("test address");
        self.peer(&address).expect("peer registered with add_peer")
    }
}

pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                powered: true,
                discovering: false,
                external_discovery: false,
                peers: Vec::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Registers a peer that is in range and not connected
    pub fn add_peer(&self, address: &str, name: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.peers.push(Peer {
            address: BdAddr::parse(address).expect("test address"),
            name: name.map(str::to_string),
            visible: true,
            connected: false,
            hang_connect: false,
            hang_link_checks: false,
            hang_watch: false,
            connect_error: None,
            values: HashMap::new(),
            io_errors: HashMap::new(),
            subscribers: Vec::new(),
        });
    }

    pub fn set_visible(&self, address: &str, visible: bool) {
        self.state.lock().unwrap().peer_mut(address).visible = visible;
    }

    pub fn set_powered(&self, powered: bool) {
        self.state.lock().unwrap().powered = powered;
    }

    /// Simulates a discovery session started by another process
    pub fn set_external_discovery(&self, active: bool) {
        self.state.lock().unwrap().external_discovery = active;
    }

    pub fn fail_connect(&self, address: &str, error: TransportError) {
        self.state.lock().unwrap().peer_mut(address).connect_error = Some(error);
    }

    pub fn hang_connect(&self, address: &str) {
        self.state.lock().unwrap().peer_mut(address).hang_connect = true;
    }

    /// Link state queries never answer
    pub fn hang_link_checks(&self, address: &str) {
        self.state.lock().unwrap().peer_mut(address).hang_link_checks = true;
    }

    /// Disconnect subscriptions never answer
    pub fn hang_watch(&self, address: &str) {
        self.state.lock().unwrap().peer_mut(address).hang_watch = true;
    }

    pub fn set_value(&self, address: &str, uuid: Uuid, value: Vec<u8>) {
        self.state.lock().unwrap().peer_mut(address).values.insert(uuid, value);
    }

    pub fn fail_io(&self, address: &str, uuid: Uuid, error: TransportError) {
        self.state.lock().unwrap().peer_mut(address).io_errors.insert(uuid, error);
    }

    /// Link loss as seen by the remote side: state flips and subscribers are told
    pub fn drop_link(&self, address: &str) {
        let mut state = self.state.lock().unwrap();
        let peer = state.peer_mut(address);
        peer.connected = false;
        let event = DisconnectEvent {
            address: peer.address.clone(),
        };
        peer.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Link loss that nobody announces
    pub fn drop_link_silently(&self, address: &str) {
        self.state.lock().unwrap().peer_mut(address).connected = false;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn writes(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Write(addr, uuid, data) => Some((addr, uuid, data)),
                _ => None,
            })
            .collect()
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(a) if a == address))
            .count()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn adapter_powered(&self) -> bool {
        self.state.lock().unwrap().powered
    }

    async fn is_discovering(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.discovering || state.external_discovery
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall::StartDiscovery);
        state.discovering = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall::StopDiscovery);
        state.discovering = false;
        Ok(())
    }

    async fn discovered_devices(&self) -> Vec<Device> {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .filter(|p| p.visible)
            .map(|p| Device::new(p.address.clone(), p.name.clone()))
            .collect()
    }

    async fn is_device_connected(&self, address: &BdAddr) -> bool {
        let (connected, hang) = {
            let mut state = self.state.lock().unwrap();
            state
                .peer(address)
                .map_or((false, false), |p| (p.connected, p.hang_link_checks))
        };
        if hang {
            std::future::pending::<()>().await;
        }
        connected
    }

    async fn connect_device(&self, address: &BdAddr, _verify: bool) -> Result<(), TransportError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(TransportCall::Connect(address.to_string()));
            let peer = state
                .peer(address)
                .ok_or_else(|| TransportError::NotFound(address.to_string()))?;
            if let Some(e) = peer.connect_error.clone() {
                return Err(e);
            }
            if !peer.hang_connect {
                peer.connected = true;
            }
            peer.hang_connect
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect_device(&self, address: &BdAddr, _verify: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall::Disconnect(address.to_string()));
        let peer = state
            .peer(address)
            .ok_or_else(|| TransportError::NotFound(address.to_string()))?;
        peer.connected = false;
        Ok(())
    }

    async fn find_characteristic(
        &self,
        address: &BdAddr,
        uuid: Uuid,
    ) -> Result<CharacteristicLocator, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall::Find(address.to_string(), uuid));
        let peer = state
            .peer(address)
            .ok_or_else(|| TransportError::NotFound(address.to_string()))?;
        if !peer.connected {
            return Err(TransportError::Failed("Not connected".to_string()));
        }
        if !peer.values.contains_key(&uuid) {
            return Err(TransportError::NotFound(uuid.to_string()));
        }
        Ok(CharacteristicLocator::new(address.clone(), uuid))
    }

    async fn read_characteristic(
        &self,
        locator: &CharacteristicLocator,
        max_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(TransportCall::Read(locator.device().to_string(), locator.uuid()));
        let peer = state
            .peer(locator.device())
            .ok_or_else(|| TransportError::NotFound(locator.device().to_string()))?;
        if let Some(e) = peer.io_errors.get(&locator.uuid()) {
            return Err(e.clone());
        }
        let value = peer
            .values
            .get(&locator.uuid())
            .ok_or_else(|| TransportError::NotFound(locator.uuid().to_string()))?;
        Ok(value.iter().take(max_len).copied().collect())
    }

    async fn write_characteristic(
        &self,
        locator: &CharacteristicLocator,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall::Write(
            locator.device().to_string(),
            locator.uuid(),
            data.to_vec(),
        ));
        let peer = state
            .peer(locator.device())
            .ok_or_else(|| TransportError::NotFound(locator.device().to_string()))?;
        if let Some(e) = peer.io_errors.get(&locator.uuid()) {
            return Err(e.clone());
        }
        peer.values.insert(locator.uuid(), data.to_vec());
        Ok(())
    }

    async fn watch_disconnects(
        &self,
        address: &BdAddr,
    ) -> Result<mpsc::UnboundedReceiver<DisconnectEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let hang = {
            let mut state = self.state.lock().unwrap();
            let peer = state
                .peer(address)
                .ok_or_else(|| TransportError::NotFound(address.to_string()))?;
            if !peer.hang_watch {
                peer.subscribers.push(tx);
            }
            peer.hang_watch
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(rx)
    }
}
