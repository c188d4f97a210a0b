//! Poll a readiness condition on a fixed interval, bounded by a timeout

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Sleep `interval`, then run `check`; repeat until it reports ready or `timeout` has passed
///
/// Returns `Ok(true)` once ready, `Ok(false)` on timeout. Errors from `check`
/// end polling immediately.
pub async fn poll_until<F, Fut, E>(interval: Duration, timeout: Duration, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let started = Instant::now();
    loop {
        tokio::time::sleep(interval).await;
        if check().await? {
            return Ok(true);
        }
        if started.elapsed() >= timeout {
            return Ok(false);
        }
    }
}
