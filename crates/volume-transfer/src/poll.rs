//! Bounded polling with a fixed interval

use async_io::Timer;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::{Error, Result};

/// Poll `check` every `interval` until it yields a value or `ceiling` elapses
///
/// `check` returning `Ok(None)` means "not yet"; errors abort the loop.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    ceiling: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if started.elapsed() >= ceiling {
            return Err(Error::Timeout {
                what: what.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        trace!(%what, "condition not met yet");
        Timer::after(interval).await;
    }
}
