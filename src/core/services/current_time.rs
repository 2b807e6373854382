//! Current Time Service
//! Keeps the device clock in step with the host's local time.

use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use log::{debug, info, warn};

use crate::core::bluetooth::{
    ManagedDevice, CURRENT_TIME_MIN_SIZE, CURRENT_TIME_PAYLOAD_SIZE, CURRENT_TIME_READ_SIZE,
    UUID_CURRENT_TIME,
};
use crate::core::services::GattService;

/// Largest drift, in comparable-timestamp seconds, that is left alone
const MAX_DRIFT_SECS: f64 = 1.0;

/// Date and time as carried by the current time characteristic
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DeviceTime {
    /// Decodes the leading 7 bytes. Returns None for shorter payloads.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < CURRENT_TIME_MIN_SIZE {
            return None;
        }
        Some(Self {
            year: u16::from_le_bytes([data[0], data[1]]),
            month: data[2],
            day: data[3],
            hour: data[4],
            minute: data[5],
            second: data[6],
        })
    }

    pub fn from_datetime(time: &NaiveDateTime) -> Self {
        Self {
            year: time.year().clamp(0, u16::MAX as i32) as u16,
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
        }
    }

    /// Write payload: year (LE), month, day, hour, minute, second,
    /// fractions of seconds and reason for change (both zero).
    pub fn encode(&self) -> [u8; CURRENT_TIME_PAYLOAD_SIZE] {
        let [year_lo, year_hi] = self.year.to_le_bytes();
        [
            year_lo,
            year_hi,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            0,
            0,
        ]
    }

    /// Monotonic scalar used to measure drift.
    ///
    /// Approximates every month with 31 days and is not an epoch; only the
    /// magnitude of the difference between two values is meaningful.
    pub fn comparable_timestamp(&self) -> f64 {
        f64::from(self.year) * (60.0 * 60.0 * 24.0 * 31.0 * 12.0)
            + f64::from(self.month) * (60.0 * 60.0 * 24.0 * 31.0)
            + f64::from(self.day) * (60.0 * 60.0 * 24.0)
            + f64::from(self.hour) * (60.0 * 60.0)
            + f64::from(self.minute) * 60.0
            + f64::from(self.second)
    }
}

impl fmt::Display for DeviceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

type TimeSource = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Sets the device's time when it deviates from local time by more than a second.
pub struct CurrentTimeService {
    now: TimeSource,
}

impl CurrentTimeService {
    /// Uses the host's local time
    pub fn new() -> Self {
        Self::with_time_source(|| Local::now().naive_local())
    }

    pub fn with_time_source<F>(now: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        Self { now: Arc::new(now) }
    }
}

impl Default for CurrentTimeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GattService for CurrentTimeService {
    fn name(&self) -> &'static str {
        "current-time"
    }

    async fn run(&self, device: &ManagedDevice) -> bool {
        let address = device.address();

        let device_time = match device
            .read_characteristic(UUID_CURRENT_TIME, CURRENT_TIME_READ_SIZE)
            .await
        {
            Ok(data) => DeviceTime::decode(&data),
            Err(e) => {
                debug!("Reading the current time of device {} failed: {}", address, e);
                None
            }
        };
        let device_time = device_time.unwrap_or_else(|| {
            warn!("Could not read enough bytes from device {}.", address);
            DeviceTime::default()
        });
        debug!("Current time on device {}: {}", address, device_time);

        let local_time = DeviceTime::from_datetime(&(self.now)());
        let delta = (local_time.comparable_timestamp() - device_time.comparable_timestamp()).abs();
        if delta <= MAX_DRIFT_SECS {
            return true;
        }

        match device
            .write_characteristic(UUID_CURRENT_TIME, &local_time.encode())
            .await
        {
            Ok(()) => {
                info!("Updated time on device {}: {}", address, local_time);
                true
            }
            Err(e) => {
                warn!("Could not update time on device {}: {}", address, e);
                false
            }
        }
    }
}
