//! Logging Setup
//!
//! The library logs through the `log` facade. Embedding applications may
//! install any logger; [`init`] provides the default one.

use std::io::Write;

use log::{Level, SetLoggerError};

/// Installs an `env_logger` with compact output.
///
/// `RUST_LOG` overrides the level; otherwise `debug` is used when `verbose`
/// is set and `info` when not. Warnings and errors carry a level prefix.
pub fn init(verbose: bool) -> Result<(), SetLoggerError> {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| match record.level() {
            Level::Warn | Level::Error => writeln!(buf, "[{}] {}", record.level(), record.args()),
            _ => writeln!(buf, "{}", record.args()),
        })
        .try_init()
}
