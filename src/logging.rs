use std::io::Write;
use std::str::FromStr;

use chrono::Local;
use log::LevelFilter;

/// Picks the effective level: each `-v` raises the configured level by one
/// step, up to trace.
pub fn effective_level(configured: &str, verbosity: u8) -> LevelFilter {
    const LEVELS: [LevelFilter; 5] = [
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ];

    let base = LevelFilter::from_str(configured.trim()).unwrap_or(LevelFilter::Info);
    if base == LevelFilter::Off && verbosity == 0 {
        return LevelFilter::Off;
    }
    let index = LEVELS.iter().position(|level| *level == base).unwrap_or(0);
    LEVELS[(index + usize::from(verbosity)).min(LEVELS.len() - 1)]
}

/// Installs the global logger. `RUST_LOG`, when set, overrides `level`.
///
/// Lines look like `2026-05-01 12:00:00 [INFO] tuya_ble_bridge_lib::core::poller: ...`.
pub fn init(level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .parse_default_env();

    // A logger may already be installed (tests, embedding)
    if builder.try_init().is_ok() {
        log::debug!("Logging initialized at {}", level);
    }
}
