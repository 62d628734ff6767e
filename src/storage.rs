use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::{ConfigPatch, Configuration, CONFIG_TAG};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("stored configuration is not valid JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("no configuration record tagged {0:?}")]
  Missing(&'static str),
  #[error("configuration record is incomplete: {0}")]
  Incomplete(serde_json::Error),
}

/// Holds configuration documents keyed by type tag.
pub struct ConfigStore {
  conn: Mutex<Connection>,
}

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS configuration (
    type TEXT PRIMARY KEY,
    updated_at TEXT NOT NULL,
    document_json TEXT NOT NULL
  );
";

impl ConfigStore {
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    Self::init(Connection::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Loads the assistant configuration. A missing or partial record is an error.
  pub async fn load(&self) -> Result<Configuration, StoreError> {
    let conn = self.conn.lock().await;
    let document = read_document(&conn, CONFIG_TAG)?.ok_or(StoreError::Missing(CONFIG_TAG))?;
    Configuration::from_document(&document).map_err(StoreError::Incomplete)
  }

  /// Merges `patch` into the stored record, creating the record when absent.
  pub async fn update(&self, patch: &ConfigPatch) -> Result<(), StoreError> {
    let mut conn = self.conn.lock().await;
    let tx = conn.transaction()?;
    let mut document = read_document(&tx, CONFIG_TAG)?.unwrap_or_default();
    patch.apply_to(&mut document)?;
    let document_json = serde_json::to_string(&document)?;
    tx.execute(
      "INSERT INTO configuration (type, updated_at, document_json) VALUES (?1, ?2, ?3)
       ON CONFLICT(type) DO UPDATE SET updated_at = excluded.updated_at, document_json = excluded.document_json",
      params![CONFIG_TAG, Utc::now().to_rfc3339(), document_json],
    )?;
    tx.commit()?;
    Ok(())
  }

  /// Returns every stored record for the configuration tag, each carrying its `type`.
  pub async fn records(&self) -> Result<Vec<Value>, StoreError> {
    let conn = self.conn.lock().await;
    let mut stmt = conn.prepare("SELECT type, document_json FROM configuration WHERE type = ?1")?;
    let rows = stmt.query_map(params![CONFIG_TAG], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut records = Vec::new();
    for row in rows {
      let (tag, document_json) = row?;
      let mut document: Map<String, Value> = serde_json::from_str(&document_json)?;
      document.insert("type".to_string(), Value::String(tag));
      records.push(Value::Object(document));
    }
    Ok(records)
  }
}

fn read_document(conn: &Connection, tag: &str) -> Result<Option<Map<String, Value>>, StoreError> {
  let raw = conn
    .query_row(
      "SELECT document_json FROM configuration WHERE type = ?1",
      params![tag],
      |row| row.get::<_, String>(0),
    )
    .optional()?;
  match raw {
    Some(json) => Ok(Some(serde_json::from_str(&json)?)),
    None => Ok(None),
  }
}
