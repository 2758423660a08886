//! Logging utilities for the `PayGate` server.

use log::LevelFilter;

use crate::config::AppMode;

/// Initialize the logging implementation. `dev` mode defaults the paygate
/// crates to `Debug` verbosity, `prod` to `Info`; dependencies stay at
/// `Warn`. `RUST_LOG` overrides either.
pub fn init_logger(mode: AppMode) {
    let own_level = match mode {
        AppMode::Dev => LevelFilter::Debug,
        AppMode::Prod => LevelFilter::Info,
    };
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .filter_module("paygate", own_level)
        .filter_module("paygate_server", own_level)
        .parse_default_env()
        .try_init();
}
