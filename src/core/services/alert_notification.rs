//! Alert Notification Service
//! Relays pending desktop notifications to the device as new alerts.

use log::{info, warn};

use crate::core::bluetooth::{
    ManagedDevice, ALERT_CATEGORY_EMAIL, ALERT_ICON_EMAIL, NEW_ALERT_PAYLOAD_SIZE,
    NEW_ALERT_TEXT_SIZE, UUID_NEW_ALERT,
};
use crate::core::notifications::NotificationSink;
use crate::core::services::GattService;
use crate::utils::truncate_utf8;

/// Builds a new-alert frame: category, alert count, icon, the summary
/// zero-padded to 32 bytes and a trailing zero.
pub fn alert_payload(summary: &str) -> [u8; NEW_ALERT_PAYLOAD_SIZE] {
    let mut payload = [0u8; NEW_ALERT_PAYLOAD_SIZE];
    payload[0] = ALERT_CATEGORY_EMAIL;
    payload[1] = 1;
    payload[2] = ALERT_ICON_EMAIL;

    let text = truncate_utf8(summary, NEW_ALERT_TEXT_SIZE).as_bytes();
    payload[3..3 + text.len()].copy_from_slice(text);
    payload
}

/// Sends the notifications of the current relay batch to the device.
///
/// The queue itself is left alone; whoever drives the services opens and
/// flushes the batch.
pub struct AlertNotificationService {
    sink: NotificationSink,
}

impl AlertNotificationService {
    pub fn new(sink: NotificationSink) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl GattService for AlertNotificationService {
    fn name(&self) -> &'static str {
        "alert-notification"
    }

    async fn run(&self, device: &ManagedDevice) -> bool {
        let mut all_succeeded = true;
        for notification in self.sink.relay_batch() {
            let payload = alert_payload(&notification.summary);
            match device.write_characteristic(UUID_NEW_ALERT, &payload).await {
                Ok(()) => info!(
                    "Sent notification to device {}: {}",
                    device.address(),
                    notification.summary
                ),
                Err(e) => {
                    warn!("Could not send notification to device {}: {}", device.address(), e);
                    all_succeeded = false;
                }
            }
        }
        all_succeeded
    }
}
