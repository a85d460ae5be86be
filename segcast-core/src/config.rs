use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SegcastConfig {
    pub recorder: RecorderSection,
    pub store: StoreSection,
    pub processor: ProcessorSection,
    pub telegram: TelegramSection,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl SegcastConfig {
    /// Byte budget for size-based segmentation, if configured.
    pub fn segment_budget(&self) -> Result<Option<u64>> {
        match &self.recorder.segment_bytes {
            None => Ok(None),
            Some(raw) => parse_size(raw)
                .map(Some)
                .ok_or_else(|| ConfigError::InvalidSize(raw.clone())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderSection {
    pub output_dir: PathBuf,
    pub check_interval_seconds: u64,
    /// Human-readable size ("10M"); when set, size-based splitting is used
    /// instead of time-based splitting.
    pub segment_bytes: Option<String>,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
    #[serde(default = "default_ytdlp")]
    pub ytdlp_path: PathBuf,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorSection {
    pub scan_interval_seconds: u64,
    /// Staleness window for the newest segment in a directory. A segment
    /// untouched for this long is presumed abandoned by its writer.
    #[serde(default = "default_inactivity")]
    pub inactivity_seconds: u64,
    pub watermark_path: Option<PathBuf>,
    #[serde(default = "default_corner")]
    pub watermark_corner: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSection {
    pub api_url: String,
    pub bot_token: String,
    pub chat_id: String,
    pub chat_id_original: String,
    #[serde(default = "default_caption")]
    pub caption_template: String,
    #[serde(default = "default_caption_original")]
    pub caption_template_original: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
}

fn default_segment_seconds() -> u64 {
    1800
}

fn default_stop_grace() -> u64 {
    5
}

fn default_ytdlp() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_inactivity() -> u64 {
    60
}

fn default_corner() -> String {
    "bottom-right".to_string()
}

fn default_caption() -> String {
    "Part {sequence_number}".to_string()
}

fn default_caption_original() -> String {
    "Original Part {sequence_number}".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SegcastConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

/// Parses "10M"-style sizes. Suffixes K/M/G/T are powers of 1024; a bare
/// integer is taken as bytes.
pub fn parse_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim().to_uppercase();
    if trimmed.is_empty() {
        return None;
    }
    let units = [
        ('K', 1024u64),
        ('M', 1024 * 1024),
        ('G', 1024 * 1024 * 1024),
        ('T', 1024u64.pow(4)),
    ];
    for (suffix, multiplier) in units {
        if let Some(number) = trimmed.strip_suffix(suffix) {
            let value: f64 = number.trim().parse().ok()?;
            if value < 0.0 {
                return None;
            }
            return Some((value * multiplier as f64) as u64);
        }
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/segcast.toml");
        let config = load_config(path).expect("fixture config should parse");
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].name, "channel-a");
        assert_eq!(config.segment_budget().unwrap(), Some(10 * 1024 * 1024));
        assert_eq!(config.processor.inactivity_seconds, 60);
        assert_eq!(config.telegram.chat_id_original, "@segcast_premium");
    }

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("10M"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("512k"), Some(512 * 1024));
        assert_eq!(parse_size("1.5G"), Some((1.5 * 1024.0 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_size("2048"), Some(2048));
        assert_eq!(parse_size("garbage"), None);
        assert_eq!(parse_size(""), None);
    }
}
