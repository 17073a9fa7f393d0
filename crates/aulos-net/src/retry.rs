use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use url::Url;

use crate::{
    error::NetError,
    traits::{Net, RangeResponse},
    types::{Headers, RangeSpec, RetryPolicy},
};

/// Retry decorator over any [`Net`].
///
/// Retries retryable failures with the policy's exponential delay. Only the
/// *opening* of a ranged stream is retried; errors surfacing mid-stream are
/// the caller's concern (it knows how many bytes it already consumed and can
/// resume from there).
#[derive(Clone, Debug)]
pub struct RetryNet<N> {
    inner: N,
    policy: RetryPolicy,
}

impl<N: Net> RetryNet<N> {
    pub fn new(inner: N, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, NetError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, NetError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(what, attempt, ?delay, %err, "retrying request");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if attempt >= self.policy.max_retries && err.is_retryable() => {
                    return Err(NetError::RetryExhausted {
                        max_retries: self.policy.max_retries,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<N: Net> Net for RetryNet<N> {
    async fn get_bytes(&self, url: Url, headers: Option<Headers>) -> Result<Bytes, NetError> {
        self.run("get_bytes", || {
            self.inner.get_bytes(url.clone(), headers.clone())
        })
        .await
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<RangeResponse, NetError> {
        self.run("get_range", || {
            self.inner.get_range(url.clone(), range, headers.clone())
        })
        .await
    }

    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError> {
        self.run("head", || self.inner.head(url.clone(), headers.clone()))
            .await
    }
}
