//! A single polling-loop primitive parameterized by interval, target
//! predicate, and timeout — replacing the ad hoc `loop { ...; sleep(...).await }`
//! bodies the teacher repeats in `rt/hypervisor/mod.rs::shutdown()` and
//! `rt/service.rs::start()` (see `examples/tangle-network-blueprint`).

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

pub struct Ticker {
    interval: Duration,
    timeout: Option<Duration>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Calls `observe` at `interval`, stopping (and returning its value)
    /// the first time it returns `Some`. If a timeout is configured and
    /// elapses first, returns `Error::Timeout`.
    pub async fn poll_until<T, F, Fut>(&self, mut observe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(value) = observe().await? {
                return Ok(value);
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Timeout(
                        "ticker deadline exceeded waiting for target state".into(),
                    ));
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn stops_as_soon_as_predicate_is_satisfied() {
        let calls = AtomicU32::new(0);
        let ticker = Ticker::new(Duration::from_millis(1));
        let result = ticker
            .poll_until(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(if n >= 2 { Some(n) } else { None })
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn times_out_when_predicate_never_satisfied() {
        let ticker = Ticker::new(Duration::from_millis(1)).with_timeout(Duration::from_millis(5));
        let result: Result<()> = ticker.poll_until(|| async { Ok(None) }).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
