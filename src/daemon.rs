//! The daemon's driving loop
//! Scans for and connects managed devices, then runs every service on the
//! connected ones, once per cycle until shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::Transport;
use crate::state::AppState;

pub struct Daemon {
    state: AppState,
    transport: Arc<dyn Transport>,
    cycle_interval: Duration,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(
        state: AppState,
        transport: Arc<dyn Transport>,
        cycle_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            transport,
            cycle_interval,
            shutdown,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// One pass: find and connect devices, then run the services.
    ///
    /// Nothing happens while the adapter is powered off.
    pub async fn run_cycle(&self) {
        if !self.transport.adapter_powered().await {
            debug!("Bluetooth adapter is powered off.");
            return;
        }

        let devices = &self.state.device_manager;
        if devices.all_managed_devices_connected().await {
            debug!("All managed devices are connected, skipping scan.");
        } else {
            match devices.scan().await {
                Ok(()) => {
                    devices.connect_discovered_managed_devices().await;
                }
                Err(e) => warn!("{}", e),
            }
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        // notifications arriving from here on wait for the next cycle
        let notifications = &self.state.notifications;
        if self.state.alert_service.is_some() {
            notifications.begin_relay();
        }
        let mut relayed = false;
        for (index, service) in self.state.services.iter().enumerate() {
            let report = devices.run_service(service.as_ref()).await;
            debug!(
                "Service {} ran on {} device(s), {} failed.",
                service.name(),
                report.invoked,
                report.failed
            );
            if self.state.alert_service == Some(index) && report.invoked > 0 {
                relayed = true;
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        // relayed notifications are not sent again
        notifications.end_relay(relayed);

        match serde_json::to_string(&devices.roster_status().await) {
            Ok(roster) => debug!("Roster: {}", roster),
            Err(e) => warn!("Could not serialize the roster: {}", e),
        }
    }

    /// Runs cycles until the shutdown token is cancelled, then tears the roster down.
    pub async fn run(mut self) {
        info!("Entering main loop.");
        while !self.shutdown.is_cancelled() {
            self.run_cycle().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.cycle_interval) => {}
            }
        }
        info!("Exited main loop.");

        self.state.device_manager.shutdown().await;
    }
}
