//! Request and response types shared by the interceptor, the cache and the sync queue.

use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Top-level document navigation rather than a subresource load
  pub navigate: bool,
}

impl FetchRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a POST carrying `body` serialized as JSON.
  pub fn post_json<B: Serialize>(url: Url, body: &B) -> Result<Self, serde_json::Error> {
    let body = serde_json::to_vec(body)?;
    Ok(
      Self::new(Method::POST, url)
        .with_header("content-type", "application/json")
        .with_body(body),
    )
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Mark this request as a document navigation.
  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether the caller expects an HTML document back.
  pub fn accepts_html(&self) -> bool {
    self.navigate
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  pub fn cache_key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Identity of a cached request: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    Self {
      method: method.as_str().to_string(),
      url: url.as_str().to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  /// Human readable form, e.g. `GET https://host/app.js`.
  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// SHA256 of the description, used as the storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Synthetic 503 with a JSON `{"error": ...}` body.
  pub fn offline_json(message: &str) -> Self {
    let body = serde_json::json!({ "error": message }).to_string();
    Self::new(503, body).with_header("content-type", "application/json")
  }

  /// Synthetic 503 with a plain text body.
  pub fn offline_text(message: &str) -> Self {
    Self::new(503, message).with_header("content-type", "text/plain")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_slice(&self.body)
  }
}
