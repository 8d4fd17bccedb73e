//! Per-request caching strategy dispatch.
//!
//! Every request is classified by its URL path:
//! - `/api/*` goes network-first with no cache fallback
//! - lesson content (`/lessons/*`, or paths mentioning `content` or `quiz`) is
//!   served cache-first, but only ever from explicit downloads
//! - everything else is stale-while-revalidate
//!
//! Network failures never surface as errors; they become synthetic responses.

use reqwest::Method;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedEntry};

use super::client::Transport;
use super::types::{FetchRequest, HttpResponse, RequestKey};

pub const API_OFFLINE_MESSAGE: &str = "You are offline. Please check your internet connection.";
pub const CONTENT_OFFLINE_MESSAGE: &str = "Content not available offline";
pub const OFFLINE_MESSAGE: &str = "Offline";

/// Which strategy a request is handled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Network-first, offline JSON error on failure
  Api,
  /// Cache-first, never populated implicitly
  EducationalContent,
  /// Stale-while-revalidate
  Static,
}

impl RequestClass {
  pub fn of(url: &Url) -> Self {
    let path = url.path();
    if path.starts_with("/api/") {
      RequestClass::Api
    } else if path.starts_with("/lessons/") || path.contains("content") || path.contains("quiz") {
      RequestClass::EducationalContent
    } else {
      RequestClass::Static
    }
  }

  fn offline_response(self) -> HttpResponse {
    match self {
      RequestClass::Api => HttpResponse::offline_json(API_OFFLINE_MESSAGE),
      RequestClass::EducationalContent => HttpResponse::offline_text(CONTENT_OFFLINE_MESSAGE),
      RequestClass::Static => HttpResponse::offline_text(OFFLINE_MESSAGE),
    }
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Stored entry for this exact request
  Cache,
  /// Cached root document served in place of an unreachable navigation
  Fallback,
  /// Synthesized because the network was unreachable
  Offline,
}

/// Result of intercepting one request.
#[derive(Debug)]
pub struct InterceptedResponse {
  pub response: HttpResponse,
  pub source: ResponseSource,
  pub class: RequestClass,
  /// Background refresh started for a stale-while-revalidate cache hit
  pub revalidation: Option<JoinHandle<()>>,
}

impl InterceptedResponse {
  fn new(response: HttpResponse, source: ResponseSource, class: RequestClass) -> Self {
    Self {
      response,
      source,
      class,
      revalidation: None,
    }
  }

  /// Wait for the background refresh, if one was started.
  pub async fn settle(&mut self) {
    if let Some(handle) = self.revalidation.take() {
      if let Err(e) = handle.await {
        warn!(error = %e, "Revalidation task failed");
      }
    }
  }
}

/// Routes requests through the cache according to their class.
pub struct FetchInterceptor<S: CacheStorage, T: Transport> {
  storage: Arc<S>,
  transport: Arc<T>,
  /// Current cache version; the only namespace read or written
  cache_name: String,
  fallback_document: Url,
}

impl<S: CacheStorage, T: Transport> FetchInterceptor<S, T> {
  pub fn new(
    storage: Arc<S>,
    transport: Arc<T>,
    cache_name: impl Into<String>,
    fallback_document: Url,
  ) -> Self {
    Self {
      storage,
      transport,
      cache_name: cache_name.into(),
      fallback_document,
    }
  }

  /// Handle one outgoing request.
  pub async fn handle(&self, request: FetchRequest) -> InterceptedResponse {
    let class = RequestClass::of(&request.url);
    debug!(method = %request.method, url = %request.url, ?class, "Intercepted");

    match class {
      RequestClass::Api => self.network_first(request, class).await,
      _ if request.method != Method::GET => self.network_first(request, class).await,
      RequestClass::EducationalContent => self.cache_first(request, class).await,
      RequestClass::Static => self.stale_while_revalidate(request, class).await,
    }
  }

  /// Network only. Any HTTP response passes through untouched.
  async fn network_first(&self, request: FetchRequest, class: RequestClass) -> InterceptedResponse {
    match self.transport.send(&request).await {
      Ok(response) => InterceptedResponse::new(response, ResponseSource::Network, class),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network unavailable");
        InterceptedResponse::new(class.offline_response(), ResponseSource::Offline, class)
      }
    }
  }

  /// Serve downloaded content; otherwise pass the network through without storing.
  async fn cache_first(&self, request: FetchRequest, class: RequestClass) -> InterceptedResponse {
    if let Some(entry) = self.lookup(&request.cache_key()) {
      return InterceptedResponse::new(entry.response, ResponseSource::Cache, class);
    }

    self.network_first(request, class).await
  }

  /// Serve the cached copy now and refresh it in the background.
  async fn stale_while_revalidate(
    &self,
    request: FetchRequest,
    class: RequestClass,
  ) -> InterceptedResponse {
    let key = request.cache_key();

    if let Some(entry) = self.lookup(&key) {
      let mut result = InterceptedResponse::new(entry.response, ResponseSource::Cache, class);
      result.revalidation = Some(self.spawn_revalidation(request));
      return result;
    }

    match self.transport.send(&request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&key, &response);
        }
        InterceptedResponse::new(response, ResponseSource::Network, class)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network unavailable, trying cache fallbacks");

        // A concurrent request may have filled the entry meanwhile
        if let Some(entry) = self.lookup(&key) {
          return InterceptedResponse::new(entry.response, ResponseSource::Cache, class);
        }

        if request.accepts_html() {
          if let Some(entry) = self.lookup(&RequestKey::get(&self.fallback_document)) {
            return InterceptedResponse::new(entry.response, ResponseSource::Fallback, class);
          }
        }

        InterceptedResponse::new(class.offline_response(), ResponseSource::Offline, class)
      }
    }
  }

  fn spawn_revalidation(&self, request: FetchRequest) -> JoinHandle<()> {
    let this = self.clone();
    tokio::spawn(async move {
      match this.transport.send(&request).await {
        Ok(response) if response.is_success() => this.store(&request.cache_key(), &response),
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Revalidation kept cached copy");
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "Revalidation failed, kept cached copy");
        }
      }
    })
  }

  /// Cache read; storage errors count as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.get(&self.cache_name, key) {
      Ok(Some(entry)) => {
        debug!(key = %entry.request_key, cached_at = %entry.cached_at, "Cache hit");
        Some(entry)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(key = %key.description(), error = %e, "Cache read failed");
        None
      }
    }
  }

  fn store(&self, key: &RequestKey, response: &HttpResponse) {
    if let Err(e) = self.storage.put(&self.cache_name, key, response) {
      warn!(key = %key.description(), error = %e, "Cache write failed");
    }
  }
}

impl<S: CacheStorage, T: Transport> Clone for FetchInterceptor<S, T> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      transport: Arc::clone(&self.transport),
      cache_name: self.cache_name.clone(),
      fallback_document: self.fallback_document.clone(),
    }
  }
}
