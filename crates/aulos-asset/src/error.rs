use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AssetError {
    /// No sample satisfies the search — the asset genuinely has nothing
    /// there.
    #[error("no segment satisfies the request")]
    NotFound,

    /// The seek target is not parseable yet; retry after more metadata
    /// arrives.
    #[error("seek target precedes the parseable range")]
    BeforeStart,

    /// Legitimate end of playback, not a failure.
    #[error("playback position is past the end of the asset")]
    PastEnd,
}

pub type AssetResult<T> = Result<T, AssetError>;
