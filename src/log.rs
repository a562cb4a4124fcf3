//! Structured logging setup for the maestro binary.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedding application's job. The binary calls [`init`], which writes to
//! `~/.maestro/maestro.log` (truncated on startup).
//!
//! Log levels:
//! - ERROR: Workflow failures and exhausted persistence retries
//! - WARN: Task retries, evicted workers, failing event subscribers
//! - INFO: Session lifecycle and phase transitions
//! - DEBUG: Scheduling rounds and dispatch detail
//! - TRACE: Event bus traffic
//!
//! Debug mode can be enabled with `--debug` or `MAESTRO_DEBUG=1`. A
//! `MAESTRO_LOG` filter directive (e.g. `maestro=trace`) overrides both.

use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::Result;

/// Environment variable holding an explicit filter directive.
pub const LOG_FILTER_ENV: &str = "MAESTRO_LOG";

/// Environment variable enabling debug logging.
pub const DEBUG_ENV: &str = "MAESTRO_DEBUG";

/// Check whether debug logging was requested through the environment.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build the filter used by [`init`].
pub fn filter(debug: bool) -> EnvFilter {
    let default_level = if debug || debug_from_env() {
        "debug"
    } else {
        "info"
    };
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a global subscriber writing to the maestro log file.
///
/// Returns an error if the log directory cannot be created. Calling this
/// twice is harmless: the second installation attempt is ignored.
pub fn init(debug: bool) -> Result<()> {
    let path = EngineConfig::log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = File::create(&path)?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init();

    tracing::info!(path = %path.display(), "logging initialized");
    Ok(())
}
