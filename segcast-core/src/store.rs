use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;

use crate::queue::RenditionKind;
use crate::sqlite::configure_connection;

const STREAMS_SCHEMA: &str = include_str!("../../sql/streams.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open stream store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on stream store: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("stream store path not configured")]
    MissingStore,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One Stream Document: metadata for a single external stream id, extended
/// with one rendition-path pair per processed segment.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub stream_id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub file_path: String,
}

impl StreamRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            stream_id: row.get("stream_id")?,
            title: row.get("title")?,
            uploader: row.get("uploader")?,
            description: row.get("description")?,
            start_time: row.get("start_time")?,
            file_path: row.get("file_path")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for StreamStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl StreamStoreBuilder {
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

    pub fn build(self) -> StoreResult<StreamStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(StreamStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct StreamStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl StreamStore {
    pub fn builder() -> StreamStoreBuilder {
        StreamStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        StreamStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(STREAMS_SCHEMA)?;
        Ok(())
    }

    /// Creates or refreshes the document for a stream id. At-least-once
    /// safe: repeating the upsert with the same data is a no-op beyond the
    /// updated_at touch.
    pub fn upsert_stream(&self, record: &StreamRecord) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO streams (stream_id, title, uploader, description, start_time, file_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(stream_id) DO UPDATE SET
                 title = excluded.title,
                 uploader = excluded.uploader,
                 description = excluded.description,
                 file_path = excluded.file_path,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                &record.stream_id,
                &record.title,
                &record.uploader,
                &record.description,
                record.start_time,
                &record.file_path,
            ],
        )?;
        Ok(())
    }

    /// Records one rendition path under its ordinal. Distinct ordinals
    /// commute, so out-of-order processing converges to the same mapping.
    pub fn set_rendition(
        &self,
        stream_id: &str,
        sequence: i64,
        kind: RenditionKind,
        path: &str,
    ) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO renditions (stream_id, sequence, kind, path)
             VALUES (?1, ?2, ?3, ?4)",
            params![stream_id, sequence, kind.as_str(), path],
        )?;
        Ok(())
    }

    pub fn get_stream(&self, stream_id: &str) -> StoreResult<Option<StreamRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM streams WHERE stream_id = ?1",
                [stream_id],
                StreamRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Ordinal-ordered rendition paths for one stream and kind.
    pub fn renditions(
        &self,
        stream_id: &str,
        kind: RenditionKind,
    ) -> StoreResult<BTreeMap<i64, String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT sequence, path FROM renditions
             WHERE stream_id = ?1 AND kind = ?2 ORDER BY sequence",
        )?;
        let mut rows = stmt.query(params![stream_id, kind.as_str()])?;
        let mut map = BTreeMap::new();
        while let Some(row) = rows.next()? {
            map.insert(row.get(0)?, row.get(1)?);
        }
        Ok(map)
    }

    pub fn stream_count(&self) -> StoreResult<i64> {
        let conn = self.open()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM streams", [], |row| row.get(0))?)
    }
}
