use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Runs `future` under `duration`. Both a missed deadline and an inner error name what was
/// being done, e.g. `"timed out reading upstream response"`.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    match timeout(duration, future).await {
        Ok(result) => result.with_context(|| format!("failed while {context}")),
        Err(_) => Err(anyhow!("timed out {context}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn reports_elapsed_deadline_with_context() {
        let err = timeout_with_context(
            Duration::from_millis(10),
            std::future::pending::<io::Result<()>>(),
            "reading upstream response",
        )
        .await
        .expect_err("pending future should time out");
        assert_eq!(err.to_string(), "timed out reading upstream response");
    }

    #[tokio::test]
    async fn wraps_inner_error() {
        let err = timeout_with_context(
            Duration::from_secs(1),
            async { Err::<(), _>(io::Error::other("boom")) },
            "writing cache entry",
        )
        .await
        .expect_err("inner error should propagate");
        assert_eq!(err.to_string(), "failed while writing cache entry");
        assert_eq!(err.root_cause().to_string(), "boom");
    }

    #[tokio::test]
    async fn passes_through_success() -> Result<()> {
        let value = timeout_with_context(
            Duration::from_secs(1),
            async { Ok::<_, io::Error>(7) },
            "computing",
        )
        .await?;
        assert_eq!(value, 7);
        Ok(())
    }
}
