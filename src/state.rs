//! Application state management
//! This module assembles the device roster, the notification queue and the
//! services the daemon runs from the configuration.

use std::sync::Arc;

use log::{info, warn};

use crate::config::DaemonConfig;
use crate::core::bluetooth::{DeviceManager, Transport};
use crate::core::notifications::NotificationSink;
use crate::core::services::{AlertNotificationService, CurrentTimeService, GattService};

/// Everything the driving loop works on
pub struct AppState {
    pub device_manager: DeviceManager,
    pub notifications: NotificationSink,
    /// Run in order, once per cycle
    pub services: Vec<Box<dyn GattService>>,
    /// Position of the service relaying `notifications`, if it is enabled
    pub alert_service: Option<usize>,
}

impl AppState {
    /// Creates a new AppState instance from the config
    pub fn new(config: &DaemonConfig, transport: Arc<dyn Transport>) -> Self {
        let mut device_manager =
            DeviceManager::new(transport, config.timeouts(), config.scan_window());
        for address in &config.managed_devices {
            // rejected entries are logged by the manager
            let _ = device_manager.add_managed_device(address);
        }
        if device_manager.managed_devices_count() == 0 {
            warn!("No managed devices configured, the daemon has nothing to connect to.");
        }

        let notifications = NotificationSink::new();
        let mut services: Vec<Box<dyn GattService>> = Vec::new();
        let mut alert_service = None;
        if config.services.current_time {
            services.push(Box::new(CurrentTimeService::new()));
        }
        if config.services.alert_notification {
            alert_service = Some(services.len());
            services.push(Box::new(AlertNotificationService::new(notifications.clone())));
        }

        info!(
            "Managing {} device(s) with {} service(s).",
            device_manager.managed_devices_count(),
            services.len()
        );
        Self {
            device_manager,
            notifications,
            services,
            alert_service,
        }
    }
}
