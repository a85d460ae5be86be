use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::queue::{DeliveryQueueStore, NewTask, QueueError, RenditionKind};
use crate::sidecar::SessionDescriptor;
use crate::store::{StoreError, StreamRecord, StreamStore};
use crate::transcode::{Corner, TranscodeError, Transcoder};

pub const SEGMENT_EXTENSION: &str = "ts";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("segment has no parseable ordinal: {0}")]
    BadSegmentName(PathBuf),
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub recording_root: PathBuf,
    pub inactivity: Duration,
    pub watermark: Option<PathBuf>,
    pub corner: Corner,
}

/// Outcome of processing one segment that went all the way through.
#[derive(Debug, Clone)]
pub struct ProcessedSegment {
    pub stream_id: String,
    pub sequence_number: i64,
    pub watermarked: PathBuf,
    pub original: PathBuf,
    pub tasks_enqueued: usize,
}

pub struct SegmentProcessor {
    options: ProcessorOptions,
    transcoder: Transcoder,
    streams: StreamStore,
    queue: DeliveryQueueStore,
}

impl SegmentProcessor {
    pub fn new(
        options: ProcessorOptions,
        transcoder: Transcoder,
        streams: StreamStore,
        queue: DeliveryQueueStore,
    ) -> Self {
        Self {
            options,
            transcoder,
            streams,
            queue,
        }
    }

    /// One scan pass over the recording tree. Per-segment failures are
    /// logged and skipped; the next pass retries them.
    pub async fn run_once(&self) -> usize {
        let mut processed = 0;
        for segment in self.collect_ready() {
            match self.process_segment(&segment).await {
                Ok(Some(done)) => {
                    info!(
                        stream_id = %done.stream_id,
                        sequence = done.sequence_number,
                        tasks = done.tasks_enqueued,
                        "segment processed"
                    );
                    processed += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(segment = %segment.display(), error = %err, "failed to process segment");
                }
            }
        }
        processed
    }

    pub async fn run(&self, scan_interval: Duration) {
        loop {
            self.run_once().await;
            tokio::time::sleep(scan_interval).await;
        }
    }

    /// Raw segments eligible for processing, in ascending sequence order
    /// per directory. Everything but the newest file in a directory is
    /// closed by definition (the writer rolled past it); the newest is
    /// closed only once it has gone stale.
    pub fn collect_ready(&self) -> Vec<PathBuf> {
        let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for entry in WalkDir::new(&self.options.recording_root)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().map(|ext| ext == SEGMENT_EXTENSION) == Some(true)
            {
                if let Some(parent) = path.parent() {
                    by_dir
                        .entry(parent.to_path_buf())
                        .or_default()
                        .push(path.to_path_buf());
                }
            }
        }

        let mut ready = Vec::new();
        for (_, mut segments) in by_dir {
            // Ordinal order, not filename order: video_1000 follows
            // video_999.
            segments.sort_by_key(|segment| (segment_ordinal(segment).ok(), segment.clone()));
            let last = segments.len().saturating_sub(1);
            for (position, segment) in segments.into_iter().enumerate() {
                if position < last || self.is_stale(&segment) {
                    ready.push(segment);
                } else {
                    debug!(segment = %segment.display(), "newest segment still active, skipping");
                }
            }
        }
        ready
    }

    fn is_stale(&self, segment: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(segment) else {
            return false;
        };
        let Ok(mtime) = metadata.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(mtime)
            .map(|age| age > self.options.inactivity)
            .unwrap_or(false)
    }

    /// Processes one closed segment: produce the rendition pair, delete
    /// the source, then record metadata and enqueue deliveries. Returns
    /// `Ok(None)` when the segment was already done or lacks a sidecar.
    pub async fn process_segment(&self, source: &Path) -> ProcessorResult<Option<ProcessedSegment>> {
        let watermarked = source.with_extension("mp4");
        let original = rendition_sibling(source, "_orig.mp4");

        if watermarked.exists() && original.exists() {
            // Re-scan after a crash between deletion and store writes:
            // restore the pairing invariant, enqueue nothing twice.
            if source.exists() {
                std::fs::remove_file(source).map_err(|io| ProcessorError::Io {
                    source: io,
                    path: source.to_path_buf(),
                })?;
            }
            return Ok(None);
        }

        info!(segment = %source.display(), "processing segment");
        self.transcoder.remux(source, &original).await?;
        self.produce_watermarked(source, &watermarked).await?;

        // Both renditions exist from here on; only now may the source go.
        std::fs::remove_file(source).map_err(|io| ProcessorError::Io {
            source: io,
            path: source.to_path_buf(),
        })?;

        let session_dir = source.parent().unwrap_or(Path::new("."));
        let descriptor = match SessionDescriptor::read(session_dir) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(
                    segment = %source.display(),
                    error = %err,
                    "missing or unreadable sidecar, renditions kept but no deliveries enqueued"
                );
                return Ok(None);
            }
        };

        let sequence_number = segment_ordinal(source)?;
        self.record_segment(&descriptor, session_dir, sequence_number, &watermarked, &original)
            .map(Some)
    }

    /// The watermarked rendition: an overlay re-encode when an image is
    /// configured and present, otherwise a second remux so the pairing
    /// invariant still holds.
    async fn produce_watermarked(&self, source: &Path, dest: &Path) -> ProcessorResult<()> {
        match self
            .options
            .watermark
            .as_deref()
            .filter(|image| image.exists())
        {
            Some(image) => {
                self.transcoder
                    .overlay(source, image, self.options.corner, dest)
                    .await?
            }
            None => self.transcoder.remux(source, dest).await?,
        }
        Ok(())
    }

    fn record_segment(
        &self,
        descriptor: &SessionDescriptor,
        session_dir: &Path,
        sequence_number: i64,
        watermarked: &Path,
        original: &Path,
    ) -> ProcessorResult<ProcessedSegment> {
        self.streams.upsert_stream(&StreamRecord {
            stream_id: descriptor.id.clone(),
            title: descriptor.title.clone(),
            uploader: descriptor.uploader.clone(),
            description: descriptor.description.clone(),
            start_time: Utc::now(),
            file_path: session_dir.to_string_lossy().to_string(),
        })?;

        let watermarked_path = watermarked.to_string_lossy().to_string();
        let original_path = original.to_string_lossy().to_string();
        self.streams.set_rendition(
            &descriptor.id,
            sequence_number,
            RenditionKind::Watermarked,
            &watermarked_path,
        )?;
        self.streams.set_rendition(
            &descriptor.id,
            sequence_number,
            RenditionKind::Original,
            &original_path,
        )?;

        let info = descriptor.snapshot();
        let mut tasks_enqueued = 0;
        for (kind, path) in [
            (RenditionKind::Watermarked, &watermarked_path),
            (RenditionKind::Original, &original_path),
        ] {
            let inserted = self.queue.enqueue(&NewTask {
                stream_id: descriptor.id.clone(),
                sequence_number,
                file_path: path.clone(),
                info: info.clone(),
                target_type: kind,
            })?;
            if inserted {
                tasks_enqueued += 1;
            }
        }

        Ok(ProcessedSegment {
            stream_id: descriptor.id.clone(),
            sequence_number,
            watermarked: watermarked.to_path_buf(),
            original: original.to_path_buf(),
            tasks_enqueued,
        })
    }
}

fn rendition_sibling(source: &Path, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    source.with_file_name(format!("{stem}{suffix}"))
}

/// `video_000.ts` carries ordinal 1: filenames are zero-based, stored
/// sequence numbers start at one.
pub fn segment_ordinal(source: &Path) -> ProcessorResult<i64> {
    source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("video_"))
        .and_then(|index| index.parse::<i64>().ok())
        .map(|index| index + 1)
        .ok_or_else(|| ProcessorError::BadSegmentName(source.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_from_filename() {
        assert_eq!(segment_ordinal(Path::new("/x/video_000.ts")).unwrap(), 1);
        assert_eq!(segment_ordinal(Path::new("/x/video_012.ts")).unwrap(), 13);
        assert!(segment_ordinal(Path::new("/x/clip.ts")).is_err());
    }

    #[test]
    fn rendition_names() {
        let source = Path::new("/x/video_003.ts");
        assert_eq!(source.with_extension("mp4"), Path::new("/x/video_003.mp4"));
        assert_eq!(
            rendition_sibling(source, "_orig.mp4"),
            Path::new("/x/video_003_orig.mp4")
        );
    }
}
