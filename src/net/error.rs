use thiserror::Error;

/// Transport-level failure: no HTTP response was obtained.
///
/// A response with an error status is not a `FetchError`; it is passed back
/// to the caller as an ordinary `HttpResponse`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Request timed out: {0}")]
  Timeout(String),

  #[error("Network error: {0}")]
  Network(String),

  #[error("Invalid URL: {0}")]
  InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      FetchError::Timeout(e.to_string())
    } else {
      FetchError::Network(e.to_string())
    }
  }
}

impl From<url::ParseError> for FetchError {
  fn from(e: url::ParseError) -> Self {
    FetchError::InvalidUrl(e.to_string())
  }
}
