//! Bluetooth device addresses
//! Parsing, validation and canonical formatting of `XX:XX:XX:XX:XX:XX` addresses.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a textual device address, separators included.
pub const DEVICE_ADDRESS_LENGTH: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid device address: {0:?}")]
    Invalid(String),
}

/// A Bluetooth device address in canonical form (upper-case hex, colon separated).
///
/// Two addresses compare equal regardless of the case they were parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr(String);

impl BdAddr {
    /// Parses and normalizes an address.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if !is_valid_address(address) {
            return Err(AddressError::Invalid(address.to_string()));
        }

        let canonical = address
            .bytes()
            .enumerate()
            .map(|(i, b)| {
                if i % 3 == 2 {
                    ':'
                } else {
                    b.to_ascii_uppercase() as char
                }
            })
            .collect();
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address with separators replaced by underscores, as BlueZ names its device objects.
    pub fn to_object_name(&self) -> String {
        format!("dev_{}", self.0.replace(':', "_"))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BdAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Returns true if `address` has exactly 17 bytes with hex digits at every
/// non-separator position. Separator positions are not inspected.
pub fn is_valid_address(address: &str) -> bool {
    let bytes = address.as_bytes();
    if bytes.len() != DEVICE_ADDRESS_LENGTH {
        return false;
    }

    bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 2)
        .all(|(_, b)| b.is_ascii_hexdigit())
}

/// Pulls the last MAC address out of a platform-specific device identifier.
///
/// WinRT ids look like `BluetoothLE#BluetoothLEaa:bb:..-11:22:..`, BlueZ ids carry
/// the address either bare or in object-path form (`dev_11_22_..`).
pub fn extract_mac_address(device_id: &str) -> Option<BdAddr> {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    let re = MAC_RE.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").expect("MAC address pattern is valid")
    });
    re.find_iter(device_id)
        .last()
        .and_then(|m| BdAddr::parse(m.as_str()).ok())
}
