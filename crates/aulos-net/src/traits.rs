use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use url::Url;

use crate::{
    error::NetError,
    retry::RetryNet,
    types::{Headers, RangeSpec, RetryPolicy},
};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

/// A successfully opened ranged transfer.
pub struct RangeResponse {
    pub status: u16,
    /// Whether the final URL differed from the requested one.
    pub redirected: bool,
    pub stream: ByteStream,
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("redirected", &self.redirected)
            .field("stream", &"<ByteStream>")
            .finish()
    }
}

#[async_trait]
pub trait Net: Send + Sync {
    /// Fetch an entire resource into memory.
    async fn get_bytes(&self, url: Url, headers: Option<Headers>) -> Result<Bytes, NetError>;

    /// Stream a byte range of a resource.
    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<RangeResponse, NetError>;

    /// Issue a HEAD request and return the response headers.
    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError>;
}

pub trait NetExt: Net + Sized {
    /// Layer bounded exponential retry over this transport.
    fn with_retry(self, policy: RetryPolicy) -> RetryNet<Self> {
        RetryNet::new(self, policy)
    }
}

impl<T: Net> NetExt for T {}
