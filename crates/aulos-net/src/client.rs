use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client;
use url::Url;

use crate::{
    error::NetError,
    traits::{Net, RangeResponse},
    types::{Headers, NetOptions, RangeSpec},
};

/// Reqwest-backed [`Net`] implementation.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client,
    options: NetOptions,
}

impl HttpClient {
    /// # Panics
    ///
    /// Panics if the `reqwest::Client` builder fails to build.
    #[must_use]
    pub fn new(options: NetOptions) -> Self {
        let inner = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()
            .expect("failed to build reqwest client");
        Self { inner, options }
    }

    fn apply_headers(
        mut req: reqwest::RequestBuilder,
        headers: Option<Headers>,
    ) -> reqwest::RequestBuilder {
        if let Some(headers) = headers {
            for (k, v) in headers.iter() {
                req = req.header(k, v);
            }
        }
        req
    }
}

#[async_trait]
impl Net for HttpClient {
    async fn get_bytes(&self, url: Url, headers: Option<Headers>) -> Result<Bytes, NetError> {
        let req = self.inner.get(url.clone());
        let req = Self::apply_headers(req, headers);
        let req = req.timeout(self.options.request_timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url.as_str()));
        }

        resp.bytes().await.map_err(NetError::from)
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<RangeResponse, NetError> {
        let req = self
            .inner
            .get(url.clone())
            .header("Range", range.to_header_value());
        let req = Self::apply_headers(req, headers);
        // No overall timeout for ranged streaming; long transfers are fine.

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();
        if !(status.is_success() || status.as_u16() == 206) {
            return Err(NetError::http_status(status.as_u16(), url.as_str()));
        }

        let redirected = resp.url() != &url;
        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(RangeResponse {
            status: status.as_u16(),
            redirected,
            stream: Box::pin(stream),
        })
    }

    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError> {
        let req = self.inner.head(url.clone());
        let req = Self::apply_headers(req, headers);
        let req = req.timeout(self.options.request_timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url.as_str()));
        }

        let mut out = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str(), v);
            }
        }
        Ok(out)
    }
}
