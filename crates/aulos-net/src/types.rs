use std::{cmp::min, collections::HashMap, time::Duration};

/// Case-sensitive header map, small and string-typed on purpose — the
/// transport only ever forwards a handful of headers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Parse a `Content-Length` header, tolerating either spelling.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")
            .or_else(|| self.get("Content-Length"))
            .and_then(|v| v.parse::<u64>().ok())
    }
}

/// Inclusive byte range for HTTP `Range` requests; `end: None` means
/// open-ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn to_header_value(&self) -> String {
        if let Some(end) = self.end {
            format!("bytes={}-{}", self.start, end)
        } else {
            format!("bytes={}-", self.start)
        }
    }

    /// Number of bytes covered, when bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|len| len == 0)
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponential = self.base_delay * 2_u32.saturating_pow(attempt.saturating_sub(1));
        min(exponential, self.max_delay)
    }
}

#[derive(Clone, Debug)]
pub struct NetOptions {
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Max idle connections per host. 0 disables pooling.
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            pool_max_idle_per_host: 0,
        }
    }
}

/// Diagnostics for one completed (or failed) transfer.
///
/// Immutable once the transfer finishes; attached to every segment request
/// so higher layers can drive bitrate and backoff heuristics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionInfo {
    pub status_code: Option<u16>,
    pub bytes_transferred: u64,
    pub redirect_count: u32,
    pub time_to_first_byte: Option<Duration>,
    pub total_time: Duration,
    pub error: Option<String>,
}

impl ConnectionInfo {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self
                .status_code
                .is_some_and(|s| (200..300).contains(&s) || s == 206)
    }
}
