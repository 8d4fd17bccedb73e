use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// File name of the offline database inside the data directory.
pub const DATABASE_FILE: &str = "offline.db";

/// Open or create the database at `path`, creating parent directories.
pub fn open(path: &Path) -> Result<Connection> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  // The cache store and the result queue each hold a connection to the same file
  conn
    .busy_timeout(std::time::Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

  Ok(conn)
}

/// Private in-memory database, used by tests and `--ephemeral` runs.
pub fn open_in_memory() -> Result<Connection> {
  Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))
}

/// Get the default database path
pub fn default_path() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("edusync").join(DATABASE_FILE))
}
