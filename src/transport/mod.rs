//! HTTP transport for the portal API.
//!
//! Every call returns the decoded response body or a normalized [`ApiError`].
//! Auth tokens live in memory only; refreshing them is the job of whoever
//! installs the recovery handler.

mod client;
mod error;

pub use client::{
  ApiClient, AuthToken, ProgressFn, RecoveryFuture, RecoveryHandler, RequestOptions,
  UploadProgress,
};
pub use error::{ApiError, ErrorKind};
pub use reqwest::Method;
