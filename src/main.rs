mod app;
mod cache;
mod clients;
mod commands;
mod config;
mod db;
mod event;
mod messages;
mod net;
mod recommend;
mod sync;
#[cfg(test)]
mod testing;

use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "edusync")]
#[command(about = "Offline caching, quiz result sync and lesson recommendations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edusync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Use a throwaway in-memory database
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to daily files under `log_dir` when set, otherwise to stderr.
///
/// The returned guard flushes the file writer and must outlive the program.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "edusync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_tracing(config.log_dir.as_deref());

  let app = app::App::new(config, args.ephemeral)?;
  app.run(args.command).await?;

  Ok(())
}
