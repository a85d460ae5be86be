use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

const CHUNK_SIZE: usize = 1024 * 1024;

pub fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("video_{index:03}.ts"))
}

/// Copies a source stream into numbered segment files, rolling over to the
/// next index once the current file has reached `max_bytes`. Files are
/// opened lazily, so an immediately-dead source leaves nothing behind.
///
/// The writer never declares a segment complete; the processor infers that
/// from the existence of a later segment or from staleness.
pub async fn write_segments<R>(
    mut source: R,
    dir: &Path,
    max_bytes: u64,
) -> std::io::Result<u32>
where
    R: AsyncRead + Unpin,
{
    let mut index = 0u32;
    let mut current: Option<File> = None;
    let mut current_size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        // Never read past the current file's budget, so no segment ever
        // exceeds max_bytes.
        let limit = (max_bytes - current_size).min(CHUNK_SIZE as u64) as usize;
        let read = match source.read(&mut buf[..limit]).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(error = %err, "segment source read failed");
                break;
            }
        };

        if current.is_none() {
            let path = segment_path(dir, index);
            info!(path = %path.display(), "starting segment");
            current_size = 0;
            current = Some(File::create(&path).await?);
        }
        let Some(file) = current.as_mut() else { break };
        file.write_all(&buf[..read]).await?;
        current_size += read as u64;

        if current_size >= max_bytes {
            if let Some(mut file) = current.take() {
                file.flush().await?;
            }
            current_size = 0;
            index += 1;
        }
    }

    if let Some(mut file) = current.take() {
        file.flush().await?;
        index += 1;
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn rolls_over_at_byte_budget() {
        let dir = TempDir::new().unwrap();
        // 2.5 budgets of data: expect three files, the last one partial.
        let budget = 4096u64;
        let data = vec![7u8; (budget * 2 + budget / 2) as usize];
        let written = write_segments(&data[..], dir.path(), budget).await.unwrap();
        assert_eq!(written, 3);

        for index in 0..3 {
            let meta = std::fs::metadata(segment_path(dir.path(), index)).unwrap();
            if index < 2 {
                assert_eq!(meta.len(), budget);
            } else {
                assert_eq!(meta.len(), budget / 2);
            }
        }
        assert!(!segment_path(dir.path(), 3).exists());
    }

    #[tokio::test]
    async fn empty_source_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let written = write_segments(&[][..], dir.path(), 1024).await.unwrap();
        assert_eq!(written, 0);
        assert!(!segment_path(dir.path(), 0).exists());
    }

    #[test]
    fn segment_names_are_zero_padded() {
        let path = segment_path(Path::new("/tmp/session"), 7);
        assert_eq!(path, Path::new("/tmp/session/video_007.ts"));
    }
}
