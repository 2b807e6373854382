//! Core functionality for the PineConnect daemon
//! Device connectivity, the GATT services run against connected devices and
//! the notification queue feeding the alert service.

pub mod bluetooth;
pub mod notifications;
pub mod services;

// Re-export commonly used types
pub use bluetooth::{DeviceManager, ManagedDevice};
pub use notifications::{Notification, NotificationEvent, NotificationSink};
pub use services::{AlertNotificationService, CurrentTimeService, GattService};
