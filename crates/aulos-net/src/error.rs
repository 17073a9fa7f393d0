use thiserror::Error;

/// Centralized error type for aulos-net.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("request timed out")]
    Timeout,

    #[error("request failed after {max_retries} retries: {source}")]
    RetryExhausted {
        max_retries: u32,
        source: Box<NetError>,
    },
}

impl NetError {
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Whether a fresh attempt has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Timeout => true,
            NetError::Transport(_) => true,
            NetError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            NetError::RetryExhausted { .. } => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetError::HttpStatus { status, .. } => Some(*status),
            NetError::RetryExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(error.to_string())
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::server_error(NetError::http_status(503, "http://x/"), true)]
    #[case::too_many_requests(NetError::http_status(429, "http://x/"), true)]
    #[case::request_timeout(NetError::http_status(408, "http://x/"), true)]
    #[case::not_found(NetError::http_status(404, "http://x/"), false)]
    #[case::timeout(NetError::Timeout, true)]
    #[case::transport(NetError::Transport("connection reset".into()), true)]
    fn retryability(#[case] err: NetError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn exhausted_is_terminal_but_keeps_status() {
        let err = NetError::RetryExhausted {
            max_retries: 3,
            source: Box::new(NetError::http_status(502, "http://x/")),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), Some(502));
    }
}
