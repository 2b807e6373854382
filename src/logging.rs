use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::{LevelFilter, SetLoggerError};

/// Parses a level name. Besides the `log` names this accepts "warning" and
/// "verbose", the latter being one step below info.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "verbose" | "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Installs the global logger. `RUST_LOG` still refines the level per module.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    Builder::new()
        .filter_level(level)
        .parse_env(Env::default())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
}
