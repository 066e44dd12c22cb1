use std::future::Future;
use std::time::Duration;

use crate::{
    errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    },
    knobs::{
        POSTGRES_TIMEOUT,
        TRANSIENT_ERROR_INITIAL_BACKOFF,
        TRANSIENT_ERROR_MAX_BACKOFF,
    },
};

/// Spacing between retry attempts. Each call to [`RetryDelay::next_delay`]
/// hands out the current delay with equal jitter (half fixed, half random,
/// so simultaneous retries spread out but never collapse to zero) and
/// doubles the stored delay up to the cap.
#[derive(Debug)]
pub struct RetryDelay {
    initial: Duration,
    next: Duration,
    max: Duration,
    attempts: u32,
}

impl RetryDelay {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        RetryDelay {
            initial,
            next: initial,
            max,
            attempts: 0,
        }
    }

    /// How many delays have been handed out since construction or the last
    /// [`RetryDelay::reset`].
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempts = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let base = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        base / 2 + base.mul_f64(rand::random::<f64>() / 2.0)
    }
}

/// Wraps a database round-trip so a hung connection surfaces as a transient
/// error instead of stalling its workflow forever.
pub async fn with_timeout<R, E, Fut>(f: Fut) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
    Fut: Future<Output = Result<R, E>>,
{
    tokio::select! {
        biased;
        r = f => r.map_err(Into::into),
        _ = tokio::time::sleep(*POSTGRES_TIMEOUT) => {
            Err(anyhow::anyhow!(ErrorMetadata::transient(
                "PostgresTimeout",
                "database did not respond within the statement timeout",
            )))
        },
    }
}

/// Runs `f`, retrying transient failures with jittered exponential spacing
/// up to `max_attempts`. Non-transient errors surface immediately.
pub async fn retry_transient<T, F, Fut>(
    what: &'static str,
    max_attempts: u32,
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = RetryDelay::new(*TRANSIENT_ERROR_INITIAL_BACKOFF, *TRANSIENT_ERROR_MAX_BACKOFF);
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && delay.attempts() + 1 < max_attempts => {
                let wait = delay.next_delay();
                tracing::warn!(
                    attempt = delay.attempts(),
                    "{what} failed transiently, retrying in {}ms: {e:#}",
                    wait.as_millis(),
                );
                tokio::time::sleep(wait).await;
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicU32,
        Ordering,
    };
    use std::time::Duration;

    use super::{
        retry_transient,
        RetryDelay,
    };
    use crate::errors::ErrorMetadata;

    #[test]
    fn delay_doubles_and_caps() {
        let max = Duration::from_secs(4);
        let mut delay = RetryDelay::new(Duration::from_secs(1), max);
        for expected_base in [1u64, 2, 4, 4, 4] {
            let wait = delay.next_delay();
            // Equal jitter: at least half the base, never more than the
            // whole base (and so never more than the cap).
            assert!(wait >= Duration::from_millis(expected_base * 500));
            assert!(wait <= Duration::from_secs(expected_base));
            assert!(wait <= max);
        }
        assert_eq!(delay.attempts(), 5);
    }

    #[test]
    fn reset_clears_the_attempt_count() {
        let mut delay = RetryDelay::new(Duration::from_millis(100), Duration::from_secs(1));
        delay.next_delay();
        delay.next_delay();
        assert_eq!(delay.attempts(), 2);
        delay.reset();
        assert_eq!(delay.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<u32> = retry_transient("op", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("reset")
                        .context(ErrorMetadata::transient("ConnReset", "reset")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_transient("op", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_is_honored() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_transient("op", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(anyhow::anyhow!("reset")
                    .context(ErrorMetadata::transient("ConnReset", "reset")))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
