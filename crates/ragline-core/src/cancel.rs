//! Cooperative cancellation support
//!
//! Every suspension point in the pipeline races its await against the
//! caller-provided token; a fired token surfaces as `RaglineError::Cancelled`.

use crate::error::{RaglineError, Result};
use std::future::Future;
pub use tokio_util::sync::CancellationToken;

/// Run a fallible future, aborting with `Cancelled` when the token fires first.
pub async fn with_cancellation<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RaglineError::Cancelled),
        res = fut => res,
    }
}

/// Bail out early when the token has already fired.
pub fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RaglineError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();

        let result = with_cancellation(&token, async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(42)
        })
        .await;

        assert!(matches!(result, Err(RaglineError::Cancelled)));
        assert!(ensure_live(&token).is_err());
    }

    #[tokio::test]
    async fn test_live_token_passes_through() {
        let token = CancellationToken::new();
        let result = with_cancellation(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
    }
}
