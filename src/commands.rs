//! Command-line commands.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::recommend::DedupPolicy;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch a URL or API path through the offline interceptor
  Fetch {
    /// Absolute URL or path relative to api.base_url
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a document navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Download the precache list into the current cache version
  Install,
  /// Delete every cache except the current version
  Activate,
  /// List caches and their entries
  Caches,
  /// Download or drop lesson content for offline use
  Lesson {
    #[command(subcommand)]
    action: LessonAction,
  },
  /// Send a raw client message, e.g. '{"type":"CLEAR_OLD_CACHES"}'
  Message { json: String },
  /// Record quiz results
  Quiz {
    #[command(subcommand)]
    action: QuizAction,
  },
  /// Inspect or edit the pending quiz result queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Deliver queued quiz results now
  Sync {
    /// Sync tag to fire (defaults to sync.tag)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Probe connectivity and sync whenever it comes back
  Watch,
  /// Rank lessons for a learner
  Recommend(RecommendArgs),
}

#[derive(Subcommand, Debug)]
pub enum LessonAction {
  /// Cache every URL of a lesson, all or nothing
  Download {
    lesson_id: String,
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Remove a lesson's URLs from the cache
  Remove { lesson_id: String, urls: Vec<String> },
}

/// A quiz result as entered on the command line.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct QuizResultArgs {
  #[arg(long)]
  pub user: i64,
  #[arg(long)]
  pub lesson: i64,
  #[arg(long)]
  pub score: f64,
  #[arg(long)]
  pub max_score: f64,
}

#[derive(Subcommand, Debug)]
pub enum QuizAction {
  /// Upload a result now, queueing it if the server cannot be reached
  Submit(QuizResultArgs),
}

#[derive(Subcommand, Debug)]
pub enum QueueAction {
  /// Record a quiz result for later delivery
  Add(QuizResultArgs),
  /// Show queued results with their delivery state
  List {
    /// Only results that gave up
    #[arg(long)]
    failed: bool,
  },
  /// Move permanently failed results back to pending
  RetryFailed,
}

#[derive(Args, Debug)]
pub struct RecommendArgs {
  /// Fetch catalog, progress and quiz history for this user from the API
  #[arg(long, requires = "grade")]
  pub user: Option<i64>,
  /// Only recommend lessons for this grade
  #[arg(long)]
  pub grade: Option<u8>,
  /// Lesson catalog JSON file
  #[arg(long, conflicts_with = "user")]
  pub catalog: Option<PathBuf>,
  /// Progress records JSON file
  #[arg(long, conflicts_with = "user")]
  pub progress: Option<PathBuf>,
  /// Quiz results JSON file
  #[arg(long, conflicts_with = "user")]
  pub quiz_results: Option<PathBuf>,
  /// Maximum number of recommendations
  #[arg(long)]
  pub limit: Option<usize>,
  /// highest-priority or last-inserted (defaults to recommendations.dedup)
  #[arg(long)]
  pub dedup: Option<DedupPolicy>,
}
