//! Structured logging for testforge.
//!
//! Everything goes to `~/.testforge/testforge.log` (truncated on startup);
//! warnings and errors are echoed to stderr. The file filter comes from
//! `RUST_LOG` when set, otherwise from debug mode.
//!
//! Debug mode can be enabled with `--debug` flag or `TESTFORGE_DEBUG=1` env var.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{flag_enabled, Config};
use crate::{Error, Result};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) -> Result<()> {
    let env_debug = std::env::var("TESTFORGE_DEBUG")
        .map(|v| flag_enabled(&v))
        .unwrap_or(false);
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    Config::ensure_dirs()?;
    let file = File::create(Config::log_path()?)?;

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(file))
        .with_filter(file_filter(debug_enabled));
    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn file_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "testforge=debug"
    } else {
        "testforge=info"
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}
