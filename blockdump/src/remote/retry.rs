//! Bounded retry with exponential backoff around single remote calls.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{FileBody, RemoteClient};
use crate::config::RemoteConfig;
use crate::model::{BlockNode, ChildrenPage, PageInfo};
use crate::utils::errors::RemoteError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Budget for one call including all waits
    pub max_elapsed: Duration,
    /// Timeout of a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_elapsed: Duration::from_secs(config.max_retry_secs),
            call_timeout: config.call_timeout(),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Wraps any [`RemoteClient`] with the retry policy. Knows nothing about trees.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: RemoteClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.policy.call_timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(RemoteError::Network(format!(
                    "{op} timed out after {:?}",
                    self.policy.call_timeout
                ))),
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "Remote call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.policy.backoff(attempt));

            if attempt >= self.policy.max_attempts
                || started.elapsed() + delay > self.policy.max_elapsed
            {
                warn!(op, attempt, error = %err, "Giving up on remote call");
                return Err(RemoteError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient remote failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<C: RemoteClient> RemoteClient for RetryingClient<C> {
    async fn fetch_page(&self, page_id: &str) -> Result<PageInfo, RemoteError> {
        let inner = &self.inner;
        self.call("fetch_page", move || inner.fetch_page(page_id)).await
    }

    async fn fetch_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError> {
        let inner = &self.inner;
        self.call("fetch_children", move || inner.fetch_children(block_id, cursor))
            .await
    }

    async fn fetch_file(&self, url: &str) -> Result<FileBody, RemoteError> {
        let inner = &self.inner;
        self.call("fetch_file", move || inner.fetch_file(url)).await
    }

    async fn append_children(
        &self,
        parent_id: &str,
        children: &[BlockNode],
    ) -> Result<Vec<String>, RemoteError> {
        let inner = &self.inner;
        self.call("append_children", move || {
            inner.append_children(parent_id, children)
        })
        .await
    }

    async fn update_block(&self, block_id: &str, block: &BlockNode) -> Result<(), RemoteError> {
        let inner = &self.inner;
        self.call("update_block", move || inner.update_block(block_id, block))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemote, Op};
    use serde_json::json;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_elapsed: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(600),
            max_backoff: Duration::from_millis(5_000),
            max_elapsed: Duration::from_secs(60),
            call_timeout: Duration::from_secs(15),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(600));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_200));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_400));
        assert_eq!(policy.backoff(4), Duration::from_millis(4_800));
        assert_eq!(policy.backoff(5), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_rate_limited_three_times_then_succeeds() {
        let fake = FakeRemote::new();
        fake.add_page("page", "Page", vec![]);
        for _ in 0..3 {
            fake.fail_next(
                Op::FetchPage,
                RemoteError::RateLimited { retry_after: Some(Duration::from_millis(2)) },
            );
        }
        let client = RetryingClient::new(fake.clone(), fast_policy(5));

        let page = client.fetch_page("page").await.unwrap();
        assert_eq!(page.title, "Page");
        assert_eq!(fake.calls(Op::FetchPage), 4);
    }

    #[tokio::test]
    async fn test_authorization_error_is_not_retried() {
        let fake = FakeRemote::new();
        fake.fail_next(Op::FetchChildren, RemoteError::Unauthorized("bad token".into()));
        let client = RetryingClient::new(fake.clone(), fast_policy(5));

        let err = client.fetch_children("page", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized(_)));
        assert_eq!(fake.calls(Op::FetchChildren), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_permanent() {
        let fake = FakeRemote::new();
        for _ in 0..3 {
            fake.fail_next(
                Op::Append,
                RemoteError::Server { status: 502, message: "bad gateway".into() },
            );
        }
        let client = RetryingClient::new(fake.clone(), fast_policy(3));

        let err = client
            .append_children("page", &[BlockNode::new("paragraph", json!({}))])
            .await
            .unwrap_err();
        match err {
            RemoteError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RemoteError::Server { status: 502, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!client.fetch_page("missing").await.unwrap_err().is_transient());
        assert_eq!(fake.calls(Op::Append), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_cuts_retries_short() {
        let fake = FakeRemote::new();
        for _ in 0..2 {
            fake.fail_next(
                Op::FetchPage,
                RemoteError::RateLimited { retry_after: Some(Duration::from_secs(30)) },
            );
        }
        let mut policy = fast_policy(5);
        policy.max_elapsed = Duration::from_secs(1);
        let client = RetryingClient::new(fake.clone(), policy);

        let err = client.fetch_page("page").await.unwrap_err();
        assert!(matches!(err, RemoteError::RetriesExhausted { attempts: 1, .. }));
    }
}
