//! Scripted transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::net::error::FetchError;
use crate::net::{FetchRequest, HttpResponse, Transport};

pub const TEST_ORIGIN: &str = "https://school.example/";

/// Absolute URL for a path on the test origin (absolute inputs pass through).
pub fn url(path_or_url: &str) -> Url {
  crate::net::client::resolve_url(&Url::parse(TEST_ORIGIN).unwrap(), path_or_url).unwrap()
}

type Reply = Result<HttpResponse, FetchError>;

/// Transport answering from a per-URL script. Unknown URLs get a 404.
#[derive(Default)]
pub struct FakeTransport {
  routes: Mutex<HashMap<String, VecDeque<Reply>>>,
  requests: Mutex<Vec<FetchRequest>>,
  offline: AtomicBool,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Always answer `path` with `response`.
  pub fn respond(&self, path: &str, response: HttpResponse) {
    self.script(path, vec![Ok(response)]);
  }

  /// Always fail `path` with a network error.
  pub fn fail(&self, path: &str) {
    self.script(path, vec![Err(FetchError::Network("connection refused".to_string()))]);
  }

  /// Answer `path` with each reply in turn; the last one repeats.
  pub fn script(&self, path: &str, replies: Vec<Reply>) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url(path).to_string(), replies.into());
  }

  /// Fail every request while set.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<FetchRequest> {
    self.requests.lock().unwrap().clone()
  }

  /// Number of requests sent to `path`.
  pub fn hits(&self, path: &str) -> usize {
    let target = url(path);
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == target)
      .count()
  }

  fn reply(&self, request: &FetchRequest) -> Reply {
    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("offline".to_string()));
    }

    let mut routes = self.routes.lock().unwrap();
    match routes.get_mut(request.url.as_str()) {
      Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
      Some(replies) => replies.front().cloned().unwrap(),
      None => Ok(HttpResponse::new(404, "not found")),
    }
  }
}

impl Transport for FakeTransport {
  async fn send(&self, request: &FetchRequest) -> Result<HttpResponse, FetchError> {
    self.requests.lock().unwrap().push(request.clone());
    self.reply(request)
  }
}
