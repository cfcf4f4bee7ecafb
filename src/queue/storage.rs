//! Durable storage for the request queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::model::CachedRequest;

/// Slot the queue is stored under.
pub const REQUESTS_SLOT: &str = "requests";

/// Trait for queue storage backends.
///
/// The queue is always written as a whole; a failed `save` must leave the
/// previously stored queue in place.
pub trait QueueStorage: Send + Sync {
  /// Load the stored queue. `Ok(None)` when nothing was ever stored.
  fn load(&self) -> Result<Option<Vec<CachedRequest>>>;

  /// Replace the stored queue.
  fn save(&self, queue: &[CachedRequest]) -> Result<()>;
}

/// Storage that only lives as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  data: Mutex<Option<String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed the storage with raw contents, e.g. to simulate a corrupted slot.
  pub fn with_raw(raw: impl Into<String>) -> Self {
    Self {
      data: Mutex::new(Some(raw.into())),
    }
  }
}

impl QueueStorage for MemoryStorage {
  fn load(&self) -> Result<Option<Vec<CachedRequest>>> {
    let data = self.data.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    match data.as_deref() {
      Some(raw) => decode(raw).map(Some),
      None => Ok(None),
    }
  }

  fn save(&self, queue: &[CachedRequest]) -> Result<()> {
    let raw = encode(queue)?;
    let mut data = self.data.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *data = Some(raw);
    Ok(())
  }
}

/// SQLite-backed queue storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database, used by tests.
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("queue.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }

  fn read_slot(&self, slot: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM storage_slots WHERE slot = ?",
        params![slot],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read slot {}: {}", slot, e))
  }

  fn write_slot(&self, slot: &str, data: &str) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO storage_slots (slot, data, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![slot, data],
    )
    .map_err(|e| eyre!("Failed to write slot {}: {}", slot, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

const SCHEMA: &str = r#"
-- Named slots holding whole serialized documents
CREATE TABLE IF NOT EXISTS storage_slots (
    slot TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl QueueStorage for SqliteStorage {
  fn load(&self) -> Result<Option<Vec<CachedRequest>>> {
    match self.read_slot(REQUESTS_SLOT)? {
      Some(raw) => decode(&raw).map(Some),
      None => Ok(None),
    }
  }

  fn save(&self, queue: &[CachedRequest]) -> Result<()> {
    let raw = encode(queue)?;
    self.write_slot(REQUESTS_SLOT, &raw)
  }
}

fn encode(queue: &[CachedRequest]) -> Result<String> {
  serde_json::to_string(queue).map_err(|e| eyre!("Failed to serialize queue: {}", e))
}

fn decode(raw: &str) -> Result<Vec<CachedRequest>> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse stored queue: {}", e))
}
