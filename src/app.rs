use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CacheLifecycle, CacheStorage, CacheVersions, SqliteStorage};
use crate::commands::{Command, LessonAction, QueueAction, QuizAction, QuizResultArgs, RecommendArgs};
use crate::config::Config;
use crate::event::{ConnectivityMonitor, Event, EventHandler};
use crate::messages::{CacheCommand, ClientMessage};
use crate::net::client::resolve_url;
use crate::net::{FetchInterceptor, FetchRequest, HttpClient};
use crate::recommend::{self, RecommendationEngine};
use crate::sync::{NewQuizResult, ResultQueue, SubmitOutcome, SyncTrigger};

/// Wires configuration, storage and transport together for one run.
pub struct App {
  config: Config,
  storage: Arc<SqliteStorage>,
  queue: Arc<ResultQueue>,
  http: Arc<HttpClient>,
}

impl App {
  pub fn new(config: Config, ephemeral: bool) -> Result<Self> {
    let http = Arc::new(HttpClient::new(&config.api)?);

    let (storage, queue) = if ephemeral {
      (SqliteStorage::in_memory()?, ResultQueue::in_memory()?)
    } else {
      let path = config.database_path()?;
      info!(path = %path.display(), "Opening offline database");
      (SqliteStorage::open(&path)?, ResultQueue::open(&path)?)
    };

    Ok(Self {
      config,
      storage: Arc::new(storage),
      queue: Arc::new(queue),
      http,
    })
  }

  fn interceptor(&self) -> Result<FetchInterceptor<SqliteStorage, HttpClient>> {
    let fallback = resolve_url(self.http.base_url(), &self.config.cache.fallback_document)?;
    Ok(FetchInterceptor::new(
      self.storage.clone(),
      self.http.clone(),
      self.config.cache.version.clone(),
      fallback,
    ))
  }

  fn lifecycle(&self) -> CacheLifecycle<SqliteStorage, HttpClient> {
    CacheLifecycle::new(
      self.storage.clone(),
      self.http.clone(),
      CacheVersions::from_config(&self.config.cache),
      self.http.base_url().clone(),
      self.config.cache.precache.clone(),
    )
  }

  fn sync_trigger(&self) -> SyncTrigger<HttpClient> {
    SyncTrigger::new(
      self.queue.clone(),
      self.http.clone(),
      self.http.base_url().clone(),
      &self.config.sync,
    )
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Fetch {
        url,
        method,
        navigate,
      } => self.fetch(&url, &method, navigate).await,
      Command::Install => {
        let lifecycle = self.lifecycle();
        let count = lifecycle.install().await?;
        println!("Installed {} entries into {}", count, lifecycle.current_cache());
        Ok(())
      }
      Command::Activate => {
        let report = self.lifecycle().activate().await?;
        for name in &report.deleted {
          println!("Deleted {}", name);
        }
        println!("Active cache: {}", report.current);
        Ok(())
      }
      Command::Caches => self.list_caches(),
      Command::Lesson { action } => self.lesson(action).await,
      Command::Message { json } => self.message(&json).await,
      Command::Quiz {
        action: QuizAction::Submit(args),
      } => self.submit(args).await,
      Command::Queue { action } => self.queue_action(action),
      Command::Sync { tag } => {
        let trigger = self.sync_trigger();
        let tag = tag.unwrap_or_else(|| trigger.tag().to_string());
        match trigger.on_sync(&tag).await? {
          Some(report) => println!(
            "Delivered {}, retained {}, failed permanently {}",
            report.delivered, report.retained, report.dead_lettered
          ),
          None => println!("Nothing registered for sync tag '{}'", tag),
        }
        Ok(())
      }
      Command::Watch => self.watch().await,
      Command::Recommend(args) => self.recommend(args).await,
    }
  }

  async fn fetch(&self, raw: &str, method: &str, navigate: bool) -> Result<()> {
    let url = self.http.resolve(raw)?;
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

    let mut request = FetchRequest::new(method, url);
    if navigate {
      request = request.navigation().with_header("accept", "text/html");
    }

    let mut result = self.interceptor()?.handle(request).await;
    eprintln!(
      "{} {} ({:?}, {:?})",
      result.response.status,
      result.response.header("content-type").unwrap_or("-"),
      result.class,
      result.source
    );
    std::io::stdout().write_all(&result.response.body)?;
    result.settle().await;
    Ok(())
  }

  fn list_caches(&self) -> Result<()> {
    for name in self.storage.cache_names()? {
      let marker = if name == self.config.cache.version {
        " (current)"
      } else {
        ""
      };
      println!("{}{}", name, marker);
      for key in self.storage.keys(&name)? {
        println!("  {}", key);
      }
    }
    Ok(())
  }

  async fn lesson(&self, action: LessonAction) -> Result<()> {
    let lifecycle = self.lifecycle();
    match action {
      LessonAction::Download { lesson_id, urls } => {
        let count = lifecycle.cache_lesson(&lesson_id, &urls).await?;
        println!("Cached {} URLs for lesson {}", count, lesson_id);
      }
      LessonAction::Remove { lesson_id, urls } => {
        let count = lifecycle.remove_lesson(&lesson_id, &urls)?;
        println!("Removed {} URLs for lesson {}", count, lesson_id);
      }
    }
    Ok(())
  }

  async fn message(&self, json: &str) -> Result<()> {
    let command = CacheCommand::parse(json).map_err(|e| eyre!("Invalid message: {}", e))?;
    let clearing = matches!(command, CacheCommand::ClearOldCaches);

    let replies = self.dispatch_message(command).await?;
    if clearing {
      println!("Old caches cleared");
    }
    for reply in &replies {
      println!("{}", reply.to_json());
    }

    match replies.iter().map(ClientMessage::outcome).find(|o| !o.success) {
      Some(failed) => Err(eyre!(
        "Lesson {}: {}",
        failed.lesson_id,
        failed.error.as_deref().unwrap_or("failed")
      )),
      None => Ok(()),
    }
  }

  /// Run a client message and collect the replies a subscribed client sees.
  ///
  /// Clearing old caches has no reply, so its failure is returned as an error.
  async fn dispatch_message(&self, command: CacheCommand) -> Result<Vec<ClientMessage>> {
    let lifecycle = self.lifecycle();
    if let CacheCommand::ClearOldCaches = command {
      lifecycle.activate().await?;
      return Ok(Vec::new());
    }

    let mut client = lifecycle.clients().subscribe();
    lifecycle.handle_message(command).await;
    let mut replies = Vec::new();
    while let Some(reply) = client.try_recv() {
      replies.push(reply);
    }
    Ok(replies)
  }

  async fn submit(&self, args: QuizResultArgs) -> Result<()> {
    match self.sync_trigger().submit(new_result(args)).await? {
      SubmitOutcome::Delivered => println!("Result delivered"),
      SubmitOutcome::Queued(queued) => println!("Offline, queued result {}", queued.id),
      SubmitOutcome::Rejected(error) => return Err(eyre!("Result rejected: {}", error)),
    }
    Ok(())
  }

  fn queue_action(&self, action: QueueAction) -> Result<()> {
    match action {
      QueueAction::Add(args) => {
        let queued = self.queue.enqueue(&new_result(args))?;
        println!("Queued result {}", queued.id);
      }
      QueueAction::List { failed } => {
        let rows = if failed {
          self.queue.failed()?
        } else {
          self.queue.all()?
        };
        for row in rows {
          let r = &row.result;
          println!(
            "{:>5}  user {:<6} lesson {:<6} {}/{}  {}  {:?} attempts={}{}",
            r.id,
            r.user_id,
            r.lesson_id,
            r.score,
            r.max_score,
            r.timestamp.format("%Y-%m-%d %H:%M"),
            row.status,
            row.attempts,
            row
              .last_error
              .as_deref()
              .map(|e| format!(" ({})", e))
              .unwrap_or_default()
          );
        }
      }
      QueueAction::RetryFailed => {
        let count = self.queue.retry_failed()?;
        println!("Requeued {} results", count);
      }
    }
    Ok(())
  }

  async fn watch(&self) -> Result<()> {
    let trigger = self.sync_trigger();
    let monitor = ConnectivityMonitor::new(self.http.clone(), self.http.base_url().clone());
    let mut events = EventHandler::new(
      monitor,
      Duration::from_secs(self.config.sync.probe_interval_secs),
      self.config.sync.tag.clone(),
    );

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        event = events.next() => match event {
          Some(Event::ConnectivityLost) => println!("Offline"),
          Some(Event::ConnectivityRestored) => println!("Back online"),
          Some(Event::Sync(tag)) => match trigger.on_sync(&tag).await {
            Ok(Some(report)) if report.delivered + report.retained + report.dead_lettered > 0 => {
              println!(
                "Synced: delivered {}, retained {}, failed permanently {}",
                report.delivered, report.retained, report.dead_lettered
              );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Sync failed"),
          },
          Some(Event::Tick) => {}
          None => break,
        },
      }
    }
    Ok(())
  }

  async fn recommend(&self, args: RecommendArgs) -> Result<()> {
    let (catalog, progress, quiz_results) = match args.user {
      Some(user) => {
        let grade = args
          .grade
          .ok_or_else(|| eyre!("--grade is required with --user"))?;
        tokio::try_join!(
          self.http.fetch_lessons(grade),
          self.http.fetch_progress(user),
          self.http.fetch_quiz_results(user),
        )?
      }
      None => (
        read_json_list(args.catalog.as_deref())?,
        read_json_list(args.progress.as_deref())?,
        read_json_list(args.quiz_results.as_deref())?,
      ),
    };

    let catalog = match args.grade {
      Some(grade) => recommend::for_grade(&catalog, grade),
      None => catalog,
    };

    let settings = &self.config.recommendations;
    let engine = RecommendationEngine::new(args.dedup.unwrap_or(settings.dedup))
      .with_limit(args.limit.or(settings.limit));
    let ranked = engine.recommend(&catalog, &progress, &quiz_results);
    println!("{}", serde_json::to_string_pretty(&ranked)?);
    Ok(())
  }
}

fn new_result(args: QuizResultArgs) -> NewQuizResult {
  NewQuizResult {
    user_id: args.user,
    lesson_id: args.lesson,
    score: args.score,
    max_score: args.max_score,
    timestamp: chrono::Utc::now(),
  }
}

/// Read a JSON array from `path`; no path means no records.
fn read_json_list<T: DeserializeOwned>(path: Option<&Path>) -> Result<Vec<T>> {
  let Some(path) = path else {
    return Ok(Vec::new());
  };
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  serde_json::from_str(&contents).map_err(|e| eyre!("Failed to parse {}: {}", path.display(), e))
}
