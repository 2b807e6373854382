//! PineConnect daemon library
//! Keeps BLE connections to a fixed set of watches and runs GATT services on them.

// Module declarations
pub mod config;
pub mod core;
pub mod daemon;
pub mod logging;
pub mod state;
pub mod utils;
