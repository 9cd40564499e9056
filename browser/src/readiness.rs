use crate::BrowserError;
use crate::Result;
use std::future::Future;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::sleep;

/// Poll `probe` at `interval` until it yields a value or `deadline` elapses.
///
/// Every bounded wait in the launcher (profile bootstrap, endpoint readiness,
/// process exit) goes through this helper so timeout semantics stay uniform.
/// The probe itself is responsible for bounding its own per-attempt latency.
pub async fn poll_until<F, Fut, T>(
    what: &str,
    deadline: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = probe().await {
            return Ok(value);
        }
        if started.elapsed() >= deadline {
            return Err(BrowserError::Timeout(format!(
                "{what} after {}ms",
                deadline.as_millis()
            )));
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_probe_succeeds() {
        let mut calls = 0;
        let out = poll_until("test", Duration::from_secs(5), Duration::from_millis(10), || {
            calls += 1;
            let hit = calls >= 3;
            async move { hit.then_some(calls) }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline() {
        let err = poll_until(
            "never ready",
            Duration::from_millis(100),
            Duration::from_millis(10),
            || async { None::<()> },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert!(err.to_string().contains("never ready"));
    }
}
