//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Await `fut`, failing with `Error::Timeout` once `duration` elapses.
pub async fn with_deadline<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    timeout(duration, fut)
        .await
        .map_err(|_| Error::Timeout(duration))
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
