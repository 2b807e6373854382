//! Constants used throughout the daemon
//! GATT UUIDs, payload layouts and the timing defaults of the connection core.

use uuid::Uuid;

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_CURRENT_TIME: Uuid = Uuid::from_u128(0x00002a2b_0000_1000_8000_00805f9b34fb);
pub const UUID_NEW_ALERT: Uuid = Uuid::from_u128(0x00002a46_0000_1000_8000_00805f9b34fb);

/// Timeout for connection attempts in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 4000;

/// Timeout for disconnect requests in milliseconds
pub const DISCONNECT_TIMEOUT_MS: u64 = 5000;

/// Timeout for every other transport operation in milliseconds
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 4000;

/// Discovery window of a single scan in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 4;

/// Idle time between two daemon cycles in seconds
pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 10;

/// Largest current-time value we read back from a device
pub const CURRENT_TIME_READ_SIZE: usize = 32;

/// Bytes of a current-time value that carry the date and time
pub const CURRENT_TIME_MIN_SIZE: usize = 7;

/// Size of the current-time value written to a device
pub const CURRENT_TIME_PAYLOAD_SIZE: usize = 9;

/// Size of a new-alert frame
pub const NEW_ALERT_PAYLOAD_SIZE: usize = 36;

/// Bytes available for the alert text inside a new-alert frame
pub const NEW_ALERT_TEXT_SIZE: usize = 32;

/// Alert category "email"
pub const ALERT_CATEGORY_EMAIL: u8 = 1;

/// Icon id shown by the watch for mail alerts
pub const ALERT_ICON_EMAIL: u8 = 34;
