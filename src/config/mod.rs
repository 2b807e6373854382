pub mod daemon_config;

pub use daemon_config::{default_config_path, ConfigSource, DaemonConfig, ServicesConfig};
