use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use common::{Error, JournalRecord, Result};

/// Append-only sink for per-bar decisions and their outcomes.
#[async_trait]
pub trait Journal: Send {
    async fn append(&mut self, record: &JournalRecord) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open the journal named by a config value: `sqlite:<url>` selects the
/// SQLite sink, anything else is a JSON-lines file path.
pub async fn open_journal(location: &str) -> Result<Box<dyn Journal>> {
    if location.starts_with("sqlite:") {
        Ok(Box::new(SqliteJournal::connect(location).await?))
    } else {
        Ok(Box::new(JsonlJournal::open(location).await?))
    }
}

/// Load previously journaled records for `instrument`, oldest first.
/// A missing JSONL file is an empty history.
pub async fn load_history(location: &str, instrument: &str) -> Result<Vec<JournalRecord>> {
    let records = if location.starts_with("sqlite:") {
        SqliteJournal::connect(location)
            .await?
            .read_all(instrument)
            .await?
    } else if Path::new(location).exists() {
        read_jsonl(location)
            .await?
            .into_iter()
            .filter(|r| r.instrument == instrument)
            .collect()
    } else {
        Vec::new()
    };
    debug!(location, count = records.len(), "Journal history loaded");
    Ok(records)
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// Shared in-memory journal. Clones write to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    records: Arc<Mutex<Vec<JournalRecord>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

// ─── JSON lines ──────────────────────────────────────────────────────────────

/// One JSON object per line, appended to a file.
pub struct JsonlJournal {
    path: PathBuf,
    writer: tokio::io::BufWriter<tokio::fs::File>,
}

impl JsonlJournal {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Journal opened");
        Ok(Self {
            path,
            writer: tokio::io::BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Journal for JsonlJournal {
    async fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Read every record of a JSON-lines journal. Blank lines are ignored.
pub async fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::Data(format!("{}:{}: bad journal record: {e}", path.display(), i + 1))
            })
        })
        .collect()
}

// ─── SQLite ──────────────────────────────────────────────────────────────────

/// Journal rows in a migration-managed SQLite table; the record itself is
/// stored as a JSON payload next to a few indexed columns.
pub struct SqliteJournal {
    db: SqlitePool,
}

impl SqliteJournal {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("../../migrations")
            .run(&db)
            .await
            .map_err(sqlx::Error::from)?;
        info!(url, "Journal database ready");
        Ok(Self { db })
    }

    pub async fn read_all(&self, instrument: &str) -> Result<Vec<JournalRecord>> {
        let rows = sqlx::query("SELECT payload FROM journal WHERE instrument = ?1 ORDER BY id")
            .bind(instrument)
            .fetch_all(&self.db)
            .await?;
        rows.iter()
            .map(|row| -> Result<JournalRecord> {
                let payload: String = row.try_get("payload")?;
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let outcome = serde_json::to_value(record.outcome)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let timestamp = record.timestamp.to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO journal (instrument, timestamp, outcome, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&record.instrument)
        .bind(timestamp)
        .bind(outcome)
        .bind(payload)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
