use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Attempts after the first one.
pub const MAX_RETRIES: u32 = 3;

/// Run `f` until it succeeds, fails permanently, or the retry budget runs out.
///
/// Only transient errors are retried. The n-th retry waits `base * 2^(n-1)`,
/// so a 200 ms base gives 200, 400 and 800 ms. Exhaustion surfaces as
/// [`Error::Conflict`].
pub async fn with_retry<T, F, Fut>(op: &str, base: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay = base * 2u32.pow(attempt - 1);
                warn!("{op}: transient failure ({e}), retry {attempt}/{MAX_RETRIES} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::Conflict(format!(
                    "{op} failed after {} attempts: {e}",
                    MAX_RETRIES + 1
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
