#![forbid(unsafe_code)]

//! HTTP transport for aulos.
//!
//! Everything above this crate talks to the network through the [`Net`]
//! trait; the concrete [`HttpClient`] is reqwest-backed. [`RetryNet`] layers
//! bounded exponential retry on top of any [`Net`].

mod client;
mod error;
mod retry;
mod traits;
mod types;

pub use client::HttpClient;
pub use error::{NetError, NetResult};
pub use retry::RetryNet;
pub use traits::{ByteStream, Net, NetExt, RangeResponse};
pub use types::{ConnectionInfo, Headers, NetOptions, RangeSpec, RetryPolicy};
