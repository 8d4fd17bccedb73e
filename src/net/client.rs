//! HTTP transport and the platform API endpoints used by the offline layer.

use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{ApiConfig, Config};
use crate::recommend::{Lesson, LessonProgress, QuizScore};

use super::error::FetchError;
use super::types::{FetchRequest, HttpResponse};

/// Anything that can turn a `FetchRequest` into an `HttpResponse`.
///
/// Returns `Err` only when no response was received at all; HTTP error
/// statuses come back as `Ok`.
pub trait Transport: Send + Sync + 'static {
  fn send(
    &self,
    request: &FetchRequest,
  ) -> impl Future<Output = Result<HttpResponse, FetchError>> + Send;
}

/// reqwest-backed transport bound to the platform API origin.
#[derive(Clone)]
pub struct HttpClient {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", config.base_url, e))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve an absolute URL or a path relative to the API origin.
  pub fn resolve(&self, path_or_url: &str) -> Result<Url, FetchError> {
    resolve_url(&self.base_url, path_or_url)
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self.resolve(path)?;
    let response = self.send(&FetchRequest::get(url)).await?;
    if !response.is_success() {
      return Err(eyre!(
        "GET {} failed with status {}: {}",
        path,
        response.status,
        response.text()
      ));
    }
    response
      .json()
      .map_err(|e| eyre!("Failed to parse response from {}: {}", path, e))
  }

  /// Lessons appropriate for a grade.
  pub async fn fetch_lessons(&self, grade: u8) -> Result<Vec<Lesson>> {
    self.get_json(&format!("/api/lessons?grade={}", grade)).await
  }

  /// Progress records for a user.
  pub async fn fetch_progress(&self, user_id: i64) -> Result<Vec<LessonProgress>> {
    self
      .get_json(&format!("/api/users/{}/progress", user_id))
      .await
  }

  /// Quiz results already recorded on the server for a user.
  pub async fn fetch_quiz_results(&self, user_id: i64) -> Result<Vec<QuizScore>> {
    self
      .get_json(&quiz_results_path(user_id))
      .await
  }

  fn is_api_origin(&self, url: &Url) -> bool {
    url.origin() == self.base_url.origin()
  }
}

impl Transport for HttpClient {
  async fn send(&self, request: &FetchRequest) -> Result<HttpResponse, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    // Never leak the token to third-party origins
    if let Some(ref token) = self.token {
      if self.is_api_origin(&request.url) {
        builder = builder.bearer_auth(token);
      }
    }

    if let Some(ref body) = request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    debug!(method = %request.method, url = %request.url, status, "Fetched");

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

/// Endpoint that lists and accepts a user's quiz results.
///
/// API paths are rooted at the origin, so a base URL with a path prefix
/// does not leak into them.
pub fn quiz_results_path(user_id: i64) -> String {
  format!("/api/users/{}/quiz-results", user_id)
}

/// Resolve `path_or_url` against `base`. Absolute URLs are returned as-is.
pub fn resolve_url(base: &Url, path_or_url: &str) -> Result<Url, FetchError> {
  match Url::parse(path_or_url) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => Ok(base.join(path_or_url)?),
    Err(e) => Err(e.into()),
  }
}
