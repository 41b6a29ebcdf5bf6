//! Helpers for running synchronous store calls from async code.

use std::time::Duration;

use tokio::task::{spawn_blocking, JoinError};
use tracing::warn;

use crate::{Error, Result};

fn join_error(what: &str, err: JoinError) -> Error {
    if err.is_panic() {
        Error::TaskJoin(format!("{} panicked", what))
    } else {
        Error::TaskJoin(format!("{} was cancelled", what))
    }
}

/// Run `f` on the blocking pool so SQLite never stalls a runtime worker.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| join_error("store call", e))?
}

/// Like [`blocking`], but gives up on `what` after `limit`.
///
/// The closure is not interrupted; it finishes in the background.
pub async fn blocking_with_timeout<F, T>(what: &str, limit: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = spawn_blocking(f);
    match tokio::time::timeout(limit, handle).await {
        Ok(joined) => joined.map_err(|e| join_error(what, e))?,
        Err(_) => {
            warn!(operation = what, limit_ms = limit.as_millis() as u64, "blocking call timed out");
            Err(Error::Timeout(limit))
        }
    }
}

/// Compact human form: `850ms`, `12s`, `3m05s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => format!("{}ms", duration.as_millis()),
        1..=59 => format!("{}s", secs),
        _ => format!("{}m{:02}s", secs / 60, secs % 60),
    }
}
