//! Per-operation timeout and cancellation around primitive calls.

use crate::error::LdapError;
use crate::link::LinkFailure;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounds one primitive call by the operation timeout and races it against
/// the connection's cancellation token.
#[derive(Debug, Clone)]
pub(crate) struct OpGuard {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl OpGuard {
    pub(crate) fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }

    /// Outer `Err` means the call was interrupted (timeout or cancellation)
    /// and the link state is unknown; inner `Err` is the primitive failure.
    pub(crate) async fn run<T, F>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> Result<Result<T, LinkFailure>, LdapError>
    where
        F: Future<Output = Result<T, LinkFailure>>,
    {
        let bounded = async {
            match self.timeout {
                Some(after) => tokio::time::timeout(after, fut)
                    .await
                    .map_err(|_| LdapError::Timeout { operation, after }),
                None => Ok(fut.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LdapError::Cancelled { operation }),
            outcome = bounded => outcome,
        }
    }
}

/// True for errors after which the link must be dropped.
pub(crate) fn is_interruption(err: &LdapError) -> bool {
    matches!(err, LdapError::Timeout { .. } | LdapError::Cancelled { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let guard = OpGuard::new(CancellationToken::new(), Some(Duration::from_secs(5)));
        let out = guard.run("search", async { Ok::<_, LinkFailure>(7) }).await.unwrap();
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_guard_times_out() {
        let guard = OpGuard::new(CancellationToken::new(), Some(Duration::from_millis(10)));
        let err = guard
            .run("search", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, LinkFailure>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Timeout { operation: "search", .. }));
        assert!(is_interruption(&err));
    }

    #[tokio::test]
    async fn test_guard_cancelled() {
        let token = CancellationToken::new();
        let guard = OpGuard::new(token.clone(), None);
        token.cancel();
        let err = guard
            .run("bind", std::future::pending::<Result<(), LinkFailure>>())
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Cancelled { operation: "bind" }));
    }
}
