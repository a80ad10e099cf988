//! Error types for the hover preview pipeline
//!
//! Each pipeline stage has its own error enum (fetch, decode, resolve) wrapped
//! by a top-level [`Error`]. Everything is `Clone` so a single failed load can
//! be fanned out to every caller coalesced onto the same in-flight request.
//!
//! All errors use the `thiserror` crate for minimal boilerplate and proper
//! error trait implementations.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the pipeline.
///
/// Fetch, decode, and resolve failures are wrapped; whitelist and embed
/// resolution failures sit at this level because they are produced by the
/// pipeline front door rather than a single stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// Network fetch error
  #[error("Fetch error: {0}")]
  Fetch(#[from] FetchError),

  /// Image decoding error
  #[error("Decode error: {0}")]
  Decode(#[from] DecodeError),

  /// The URL's host is not covered by any enabled whitelist entry
  #[error("Domain not whitelisted: {host}")]
  DomainNotWhitelisted { host: String },

  /// An embed URL could not be resolved to a direct media URL
  #[error("Failed to resolve embed URL: {url}")]
  ResolutionFailed { url: String },

  /// The feature is disabled in the active configuration
  #[error("Image previews are disabled")]
  Disabled,

  /// The request was cancelled by a pipeline-wide clear
  #[error("Cancelled")]
  Cancelled,

  /// Generic error for miscellaneous issues
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Short user-facing reason string, suitable for a tooltip footer.
  pub fn reason(&self) -> String {
    self.to_string()
  }
}

/// Errors produced by the bounded HTTP fetcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The URL's host resolved to a loopback, link-local, or private address
  #[error("Blocked address")]
  BlockedAddress,

  /// Connect or read timeout expired
  #[error("Timed out")]
  Timeout,

  /// The server answered with a redirect on a connection that must not follow one
  #[error("Unexpected redirect (HTTP {status})")]
  UnexpectedRedirect { status: u16 },

  /// Advertised or streamed size exceeded the configured cap
  #[error("File too large ({limit_mb}MB max)")]
  TooLarge { limit_mb: u64 },

  /// Any non-200, non-3xx response status
  #[error("HTTP {0}")]
  HttpStatus(u16),

  /// The URL could not be parsed or has no host
  #[error("Invalid URL: {0}")]
  InvalidUrl(String),

  /// DNS resolution, connect, or mid-body transport failure
  #[error("Network error: {0}")]
  Transport(String),
}

/// Errors produced by the image decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  /// The source contained zero readable frames
  #[error("Image has no frames")]
  NoFrames,

  /// No decoder is available for the stream's format
  #[error("Unsupported image format")]
  UnsupportedFormat,

  /// The stream matched a known format but failed to decode
  #[error("Failed to decode image: {0}")]
  Malformed(String),
}
