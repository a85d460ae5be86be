use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;

use crate::exec::{CommandExecutor, SystemCommandExecutor};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("ffmpeg produced no output file: {0}")]
    MissingOutput(PathBuf),
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// Overlay anchor presets for the watermark image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub fn overlay_expr(&self) -> &'static str {
        match self {
            Corner::TopLeft => "10:10",
            Corner::TopRight => "main_w-overlay_w-10:10",
            Corner::BottomLeft => "10:main_h-overlay_h-10",
            Corner::BottomRight => "main_w-overlay_w-10:main_h-overlay_h-10",
        }
    }
}

impl std::str::FromStr for Corner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top-left" => Ok(Self::TopLeft),
            "top-right" => Ok(Self::TopRight),
            "bottom-left" => Ok(Self::BottomLeft),
            "bottom-right" => Ok(Self::BottomRight),
            other => Err(format!("unknown corner: {other}")),
        }
    }
}

/// Thin wrapper over the two ffmpeg operations the pipeline needs: a
/// lossless remux and a watermark overlay with re-encode.
pub struct Transcoder {
    ffmpeg: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl Transcoder {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self::with_executor(ffmpeg, Arc::new(SystemCommandExecutor))
    }

    pub fn with_executor(ffmpeg: PathBuf, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { ffmpeg, executor }
    }

    /// Container change only, no pixel changes.
    pub async fn remux(&self, source: &Path, dest: &Path) -> TranscodeResult<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            dest.to_string_lossy().to_string(),
        ];
        self.run(&args, dest).await
    }

    /// Burns a still image into the video at the given corner, re-encoding
    /// video and audio.
    pub async fn overlay(
        &self,
        source: &Path,
        image: &Path,
        corner: Corner,
        dest: &Path,
    ) -> TranscodeResult<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-i".to_string(),
            image.to_string_lossy().to_string(),
            "-filter_complex".to_string(),
            format!("overlay={}", corner.overlay_expr()),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            dest.to_string_lossy().to_string(),
        ];
        self.run(&args, dest).await
    }

    async fn run(&self, args: &[String], dest: &Path) -> TranscodeResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        for arg in args {
            command.arg(arg);
        }
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            return Err(TranscodeError::CommandFailure {
                command: format!("{} {}", self.ffmpeg.display(), args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        if !dest.exists() {
            return Err(TranscodeError::MissingOutput(dest.to_path_buf()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_parsing_and_expressions() {
        let corner: Corner = "bottom-right".parse().unwrap();
        assert_eq!(corner.overlay_expr(), "main_w-overlay_w-10:main_h-overlay_h-10");
        assert_eq!("top-left".parse::<Corner>().unwrap(), Corner::TopLeft);
        assert!("center".parse::<Corner>().is_err());
    }
}
