use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;

use crate::sqlite::configure_connection;

const QUEUE_SCHEMA: &str = include_str!("../../sql/queue.sql");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open delivery queue {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on delivery queue: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("delivery queue path not configured")]
    MissingStore,
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("invalid rendition kind: {0}")]
    InvalidKind(String),
    #[error("delivery task not found: {0}")]
    NotFound(i64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// The two renditions derived from every segment. Each maps to its own
/// delivery destination and caption template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenditionKind {
    Watermarked,
    Original,
}

impl RenditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionKind::Watermarked => "watermarked",
            RenditionKind::Original => "original",
        }
    }
}

impl std::fmt::Display for RenditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RenditionKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watermarked" => Ok(Self::Watermarked),
            "original" => Ok(Self::Original),
            other => Err(QueueError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub stream_id: String,
    pub sequence_number: i64,
    pub file_path: String,
    pub info: serde_json::Value,
    pub target_type: RenditionKind,
}

#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub id: i64,
    pub stream_id: String,
    pub sequence_number: i64,
    pub file_path: String,
    pub info: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub target_type: RenditionKind,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeliveryTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let info: Option<String> = row.get("info")?;
        Ok(Self {
            id: row.get("id")?,
            stream_id: row.get("stream_id")?,
            sequence_number: row.get("sequence_number")?,
            file_path: row.get("file_path")?,
            info: info
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(serde_json::Value::Null),
            created_at: parse_timestamp(row.get("created_at")?)?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(TaskStatus::Pending),
            target_type: row
                .get::<_, String>("target_type")?
                .parse()
                .unwrap_or(RenditionKind::Watermarked),
            published_at: parse_timestamp(row.get("published_at")?)?,
            error: row.get("error")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DeliveryQueueStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for DeliveryQueueStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl DeliveryQueueStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> QueueResult<DeliveryQueueStore> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(DeliveryQueueStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryQueueStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl DeliveryQueueStore {
    pub fn builder() -> DeliveryQueueStoreBuilder {
        DeliveryQueueStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        DeliveryQueueStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> QueueResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            QueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> QueueResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    /// Inserts a task unless one already exists for the same
    /// (stream, ordinal, rendition) key. Returns whether a row was added.
    pub fn enqueue(&self, task: &NewTask) -> QueueResult<bool> {
        let conn = self.open()?;
        let info = serde_json::to_string(&task.info).unwrap_or_else(|_| "null".to_string());
        let affected = conn.execute(
            "INSERT OR IGNORE INTO delivery_queue
                 (stream_id, sequence_number, file_path, info, status, target_type)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                &task.stream_id,
                task.sequence_number,
                &task.file_path,
                info,
                task.target_type.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Claims the oldest pending task. A single conditional UPDATE moves it
    /// to `processing` and returns it, so two workers can never claim the
    /// same row: the loser's inner SELECT no longer matches.
    pub fn claim(&self) -> QueueResult<Option<DeliveryTask>> {
        let conn = self.open()?;
        let task = conn
            .query_row(
                "UPDATE delivery_queue SET status = 'processing'
                 WHERE id = (SELECT id FROM delivery_queue WHERE status = 'pending'
                             ORDER BY created_at, id LIMIT 1)
                   AND status = 'pending'
                 RETURNING *",
                [],
                DeliveryTask::from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn mark_completed(&self, id: i64) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE delivery_queue
             SET status = 'completed', published_at = CURRENT_TIMESTAMP, error = NULL
             WHERE id = ?1",
            [id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, reason: &str) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE delivery_queue SET status = 'failed', error = ?1 WHERE id = ?2",
            params![reason, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    pub fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<DeliveryTask>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM delivery_queue");
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            params.push(rusqlite::types::Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(rusqlite::types::Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(DeliveryTask::from_row(row)?);
        }
        Ok(tasks)
    }

    pub fn counts(&self) -> QueueResult<HashMap<TaskStatus, i64>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM delivery_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Ok(status) = status.parse() {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
