//! GATT services run by the daemon
//! A service is one unit of work executed against one connected device per cycle.

mod alert_notification;
mod current_time;

pub use alert_notification::{alert_payload, AlertNotificationService};
pub use current_time::{CurrentTimeService, DeviceTime};

use crate::core::bluetooth::ManagedDevice;

/// One per-device operation the driving loop runs on every connected device.
///
/// Implementations treat read/write failures as a soft failure and return false.
/// They never touch connection state directly, only through device reads and writes.
#[async_trait::async_trait]
pub trait GattService: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &'static str;

    async fn run(&self, device: &ManagedDevice) -> bool;
}
