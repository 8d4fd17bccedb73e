//! Cache version lifecycle: install, activate, and per-lesson downloads.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::clients::ClientRegistry;
use crate::config::CacheConfig;
use crate::messages::{CacheCommand, ClientMessage, LessonOutcome};
use crate::net::client::resolve_url;
use crate::net::{FetchRequest, HttpResponse, RequestKey, Transport};

use super::storage::CacheStorage;

/// The live cache version and the names earlier releases used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersions {
  pub current: String,
  pub previous: Vec<String>,
}

impl CacheVersions {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      current: config.version.clone(),
      previous: config.previous_versions.clone(),
    }
  }

  pub fn is_previous(&self, name: &str) -> bool {
    self.previous.iter().any(|p| p == name)
  }
}

/// What `activate` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub current: String,
  pub deleted: Vec<String>,
}

/// Error sent to clients when a lesson download fails. Details stay in the log.
const LESSON_CACHE_FAILED: &str = "Failed to cache lesson";

/// Error sent to clients when a lesson removal fails.
const LESSON_REMOVE_FAILED: &str = "Failed to remove lesson";

/// Manages the current cache namespace and explicit lesson downloads.
pub struct CacheLifecycle<S: CacheStorage, T: Transport> {
  storage: Arc<S>,
  transport: Arc<T>,
  versions: CacheVersions,
  base_url: Url,
  precache: Vec<String>,
  clients: ClientRegistry,
}

impl<S: CacheStorage, T: Transport> CacheLifecycle<S, T> {
  pub fn new(
    storage: Arc<S>,
    transport: Arc<T>,
    versions: CacheVersions,
    base_url: Url,
    precache: Vec<String>,
  ) -> Self {
    Self {
      storage,
      transport,
      versions,
      base_url,
      precache,
      clients: ClientRegistry::new(),
    }
  }

  /// Clients notified about lesson operations.
  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  pub fn current_cache(&self) -> &str {
    &self.versions.current
  }

  /// Store every precache URL in the current cache.
  ///
  /// One failed fetch fails the whole install and nothing is written.
  pub async fn install(&self) -> Result<usize> {
    let entries = self.fetch_all(&self.precache).await?;
    self.storage.open_cache(&self.versions.current)?;
    self.storage.put_all(&self.versions.current, &entries)?;
    info!(cache = %self.versions.current, count = entries.len(), "Installed precache");
    Ok(entries.len())
  }

  /// Delete every cache other than the current version.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let mut deleted = Vec::new();

    for name in self.storage.cache_names()? {
      if name == self.versions.current {
        continue;
      }
      if self.versions.is_previous(&name) {
        info!(cache = %name, "Deleting previous cache version");
      } else {
        warn!(cache = %name, "Deleting unrecognized cache");
      }
      self.storage.delete_cache(&name)?;
      deleted.push(name);
    }

    self.storage.open_cache(&self.versions.current)?;

    Ok(ActivationReport {
      current: self.versions.current.clone(),
      deleted,
    })
  }

  /// Download all of a lesson's URLs into the current cache, atomically.
  pub async fn cache_lesson(&self, lesson_id: &str, urls: &[String]) -> Result<usize> {
    let entries = self.fetch_all(urls).await?;
    self.storage.put_all(&self.versions.current, &entries)?;
    info!(lesson = lesson_id, count = entries.len(), "Lesson cached for offline use");
    Ok(entries.len())
  }

  /// Remove a lesson's URLs from the current cache. Absent URLs are ignored.
  pub fn remove_lesson(&self, lesson_id: &str, urls: &[String]) -> Result<usize> {
    let mut removed = 0;
    for raw in urls {
      let url = resolve_url(&self.base_url, raw)?;
      if self
        .storage
        .delete(&self.versions.current, &RequestKey::get(&url))?
      {
        removed += 1;
      }
    }
    info!(lesson = lesson_id, removed, "Lesson removed from offline cache");
    Ok(removed)
  }

  /// Run a client command and notify every subscribed client of the outcome.
  ///
  /// Returns the notification that was broadcast, if the command produces one.
  pub async fn handle_message(&self, command: CacheCommand) -> Option<ClientMessage> {
    let message = match command {
      CacheCommand::CacheLesson { urls, lesson_id } => {
        let outcome = match self.cache_lesson(&lesson_id, &urls).await {
          Ok(_) => LessonOutcome::ok(&lesson_id),
          Err(e) => {
            warn!(lesson = %lesson_id, error = %e, "Failed to cache lesson");
            LessonOutcome::failed(&lesson_id, LESSON_CACHE_FAILED)
          }
        };
        ClientMessage::LessonCached(outcome)
      }
      CacheCommand::RemoveCachedLesson { urls, lesson_id } => {
        let outcome = match self.remove_lesson(&lesson_id, &urls) {
          Ok(_) => LessonOutcome::ok(&lesson_id),
          Err(e) => {
            warn!(lesson = %lesson_id, error = %e, "Failed to remove cached lesson");
            LessonOutcome::failed(&lesson_id, LESSON_REMOVE_FAILED)
          }
        };
        ClientMessage::LessonRemoved(outcome)
      }
      CacheCommand::ClearOldCaches => {
        if let Err(e) = self.activate().await {
          warn!(error = %e, "Failed to clear old caches");
        }
        return None;
      }
    };

    self.clients.broadcast(&message);
    Some(message)
  }

  /// Fetch every URL concurrently. Any transport error or non-2xx status fails the batch.
  async fn fetch_all(&self, urls: &[String]) -> Result<Vec<(RequestKey, HttpResponse)>> {
    let requests = urls
      .iter()
      .map(|raw| resolve_url(&self.base_url, raw).map(FetchRequest::get))
      .collect::<Result<Vec<_>, _>>()?;

    try_join_all(requests.iter().map(|request| async move {
      let response = self
        .transport
        .send(request)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to fetch {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok((request.cache_key(), response))
    }))
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::{url, FakeTransport, TEST_ORIGIN};

  fn lifecycle(
    precache: &[&str],
  ) -> (
    Arc<SqliteStorage>,
    Arc<FakeTransport>,
    CacheLifecycle<SqliteStorage, FakeTransport>,
  ) {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let transport = Arc::new(FakeTransport::new());
    let versions = CacheVersions {
      current: "edu-v2".to_string(),
      previous: vec!["edu-v1".to_string()],
    };
    let lifecycle = CacheLifecycle::new(
      storage.clone(),
      transport.clone(),
      versions,
      Url::parse(TEST_ORIGIN).unwrap(),
      precache.iter().map(|s| s.to_string()).collect(),
    );
    (storage, transport, lifecycle)
  }

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[tokio::test]
  async fn test_install_stores_precache() {
    let (storage, transport, lifecycle) = lifecycle(&["/", "/app.js"]);
    transport.respond("/", HttpResponse::new(200, "<html>"));
    transport.respond("/app.js", HttpResponse::new(200, "js"));

    assert_eq!(lifecycle.install().await.unwrap(), 2);
    assert_eq!(storage.keys("edu-v2").unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let (storage, transport, lifecycle) = lifecycle(&["/", "/app.js", "/missing.css"]);
    transport.respond("/", HttpResponse::new(200, "<html>"));
    transport.respond("/app.js", HttpResponse::new(200, "js"));
    // /missing.css falls through to 404

    assert!(lifecycle.install().await.is_err());
    assert!(storage.keys("edu-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_keeps_only_current() {
    let (storage, _transport, lifecycle) = lifecycle(&[]);
    let key = RequestKey::get(&url("/a"));
    storage.put("edu-v1", &key, &HttpResponse::new(200, "old")).unwrap();
    storage.put("scratch", &key, &HttpResponse::new(200, "x")).unwrap();
    storage.put("edu-v2", &key, &HttpResponse::new(200, "new")).unwrap();

    let report = lifecycle.activate().await.unwrap();
    assert_eq!(report.current, "edu-v2");
    assert_eq!(report.deleted.len(), 2);
    assert_eq!(storage.cache_names().unwrap(), vec!["edu-v2"]);
    assert!(storage.get("edu-v2", &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_clear_old_caches_twice_leaves_one() {
    let (storage, _transport, lifecycle) = lifecycle(&[]);
    storage.open_cache("edu-v1").unwrap();

    assert!(lifecycle.handle_message(CacheCommand::ClearOldCaches).await.is_none());
    assert!(lifecycle.handle_message(CacheCommand::ClearOldCaches).await.is_none());
    assert_eq!(storage.cache_names().unwrap(), vec!["edu-v2"]);
  }

  #[tokio::test]
  async fn test_cache_then_remove_restores_entries() {
    let (storage, transport, lifecycle) = lifecycle(&[]);
    storage
      .put("edu-v2", &RequestKey::get(&url("/app.js")), &HttpResponse::new(200, "js"))
      .unwrap();
    let before = storage.keys("edu-v2").unwrap();

    transport.respond("/lessons/7/intro.html", HttpResponse::new(200, "intro"));
    transport.respond("/lessons/7/diagram.png", HttpResponse::new(200, vec![1u8, 2, 3]));
    let urls = strings(&["/lessons/7/intro.html", "/lessons/7/diagram.png"]);
    let mut client = lifecycle.clients().subscribe();

    let reply = lifecycle
      .handle_message(CacheCommand::CacheLesson {
        urls: urls.clone(),
        lesson_id: "7".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(reply, ClientMessage::LessonCached(LessonOutcome::ok("7")));
    assert_eq!(client.recv().await, Some(reply));
    assert_eq!(storage.keys("edu-v2").unwrap().len(), 3);

    let reply = lifecycle
      .handle_message(CacheCommand::RemoveCachedLesson {
        urls,
        lesson_id: "7".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(reply, ClientMessage::LessonRemoved(LessonOutcome::ok("7")));
    assert_eq!(client.recv().await, Some(reply));
    assert_eq!(storage.keys("edu-v2").unwrap(), before);
  }

  #[tokio::test]
  async fn test_cache_lesson_failure_writes_nothing() {
    let (storage, transport, lifecycle) = lifecycle(&[]);
    transport.respond("/lessons/7/intro.html", HttpResponse::new(200, "intro"));
    transport.fail("/lessons/7/video.mp4");
    let mut client = lifecycle.clients().subscribe();

    let reply = lifecycle
      .handle_message(CacheCommand::CacheLesson {
        urls: strings(&["/lessons/7/intro.html", "/lessons/7/video.mp4"]),
        lesson_id: "7".to_string(),
      })
      .await
      .unwrap();

    let outcome = reply.outcome();
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some(LESSON_CACHE_FAILED));
    assert!(!reply.to_json().contains("video.mp4"));
    assert_eq!(client.try_recv().map(|m| m.outcome().success), Some(false));
    assert!(storage.keys("edu-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_remove_failure_hides_details() {
    let (_storage, _transport, lifecycle) = lifecycle(&[]);
    let reply = lifecycle
      .handle_message(CacheCommand::RemoveCachedLesson {
        urls: strings(&["http://[secret-host"]),
        lesson_id: "3".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(
      reply,
      ClientMessage::LessonRemoved(LessonOutcome::failed("3", LESSON_REMOVE_FAILED))
    );
    assert!(!reply.to_json().contains("secret-host"));
  }

  #[tokio::test]
  async fn test_remove_absent_urls_reports_success() {
    let (_storage, _transport, lifecycle) = lifecycle(&[]);
    let reply = lifecycle
      .handle_message(CacheCommand::RemoveCachedLesson {
        urls: strings(&["/lessons/99/nothing.html"]),
        lesson_id: "99".to_string(),
      })
      .await
      .unwrap();
    assert!(reply.outcome().success);
    assert_eq!(lifecycle.remove_lesson("99", &strings(&["/x"])).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_lesson_cache_serves_content_offline() {
    use crate::net::interceptor::ResponseSource;
    use crate::net::FetchInterceptor;

    let (storage, transport, lifecycle) = lifecycle(&[]);
    transport.respond("/lessons/7/intro.html", HttpResponse::new(200, "intro"));
    lifecycle
      .cache_lesson("7", &strings(&["/lessons/7/intro.html"]))
      .await
      .unwrap();

    transport.set_offline(true);
    let interceptor = FetchInterceptor::new(storage, transport, "edu-v2", url("/index.html"));
    let result = interceptor
      .handle(FetchRequest::get(url("/lessons/7/intro.html")))
      .await;
    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.text(), "intro");
  }
}
