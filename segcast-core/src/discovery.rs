use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

use crate::exec::{CommandExecutor, SystemCommandExecutor};
use crate::sidecar::SessionDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;

/// Result of a successful liveness probe: everything the recorder needs to
/// start capturing and everything the sidecar persists for later stages.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub media_url: String,
    pub http_headers: HashMap<String, String>,
}

impl StreamInfo {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            title: self.title.clone(),
            uploader: self.uploader.clone(),
            description: self.description.clone(),
            media_url: Some(self.media_url.clone()),
            http_headers: self.http_headers.clone(),
        }
    }
}

/// Liveness lookup for a channel URL. Returns `None` when the channel is
/// not currently live.
#[async_trait::async_trait]
pub trait StreamDiscovery: Send + Sync {
    async fn probe(&self, channel_url: &str) -> DiscoveryResult<Option<StreamInfo>>;
}

pub struct YtDlpDiscovery {
    binary: PathBuf,
    cookies: Option<PathBuf>,
    executor: Arc<dyn CommandExecutor>,
}

impl YtDlpDiscovery {
    pub fn new(binary: PathBuf, cookies: Option<PathBuf>) -> Self {
        Self::with_executor(binary, cookies, Arc::new(SystemCommandExecutor))
    }

    pub fn with_executor(
        binary: PathBuf,
        cookies: Option<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            binary,
            cookies,
            executor,
        }
    }
}

#[async_trait::async_trait]
impl StreamDiscovery for YtDlpDiscovery {
    async fn probe(&self, channel_url: &str) -> DiscoveryResult<Option<StreamInfo>> {
        let target = normalize_channel_url(channel_url);
        let mut command = Command::new(&self.binary);
        command
            .arg("-J")
            .arg("--no-warnings")
            .arg("--ignore-errors");
        if let Some(cookies) = &self.cookies {
            if cookies.exists() {
                command.arg("--cookies").arg(cookies);
            } else {
                warn!(path = %cookies.display(), "cookies file not found, probing without it");
            }
        }
        command.arg(&target);

        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            debug!(url = %target, status = output.status.code(), "probe returned non-zero status");
            return Ok(None);
        }
        let parsed: YtDlpInfo = match serde_json::from_slice(&output.stdout) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(url = %target, error = %err, "unparsable probe output");
                return Ok(None);
            }
        };
        Ok(select_live_entry(parsed))
    }
}

/// A bare YouTube channel URL resolves to the channel page, not the current
/// stream; appending `/live` makes yt-dlp return the live entry directly.
fn normalize_channel_url(channel_url: &str) -> String {
    let is_youtube = Url::parse(channel_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .map(|host| host.contains("youtube.com") || host.contains("youtu.be"))
        .unwrap_or(false);
    if is_youtube && !channel_url.contains("/watch") && !channel_url.contains("/live") {
        let mut target = channel_url.to_string();
        if !target.ends_with('/') {
            target.push('/');
        }
        target.push_str("live");
        target
    } else {
        channel_url.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    was_live: Option<bool>,
    #[serde(default)]
    http_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    entries: Option<Vec<Option<YtDlpInfo>>>,
}

impl YtDlpInfo {
    fn live(&self) -> bool {
        // was_live is sometimes set for streams that are still running.
        self.is_live.unwrap_or(false) || self.was_live.unwrap_or(false)
    }

    fn into_stream_info(self) -> Option<StreamInfo> {
        Some(StreamInfo {
            id: self.id?,
            title: self.title,
            uploader: self.uploader,
            description: self.description,
            media_url: self.url?,
            http_headers: self.http_headers.unwrap_or_default(),
        })
    }
}

fn select_live_entry(info: YtDlpInfo) -> Option<StreamInfo> {
    if let Some(entries) = info.entries {
        return entries
            .into_iter()
            .flatten()
            .find(|entry| entry.live())
            .and_then(YtDlpInfo::into_stream_info);
    }
    if info.live() {
        info.into_stream_info()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_urls_get_live_suffix() {
        assert_eq!(
            normalize_channel_url("https://www.youtube.com/@someone"),
            "https://www.youtube.com/@someone/live"
        );
        assert_eq!(
            normalize_channel_url("https://www.youtube.com/watch?v=abc"),
            "https://www.youtube.com/watch?v=abc"
        );
        assert_eq!(
            normalize_channel_url("https://www.twitch.tv/someone"),
            "https://www.twitch.tv/someone"
        );
    }

    #[test]
    fn playlist_probe_picks_live_entry() {
        let payload = serde_json::json!({
            "entries": [
                null,
                {"id": "old", "url": "https://cdn/old", "is_live": false},
                {"id": "live-now", "url": "https://cdn/live", "title": "Live!", "is_live": true}
            ]
        });
        let parsed: YtDlpInfo = serde_json::from_value(payload).unwrap();
        let info = select_live_entry(parsed).expect("live entry");
        assert_eq!(info.id, "live-now");
        assert_eq!(info.media_url, "https://cdn/live");
    }

    #[test]
    fn offline_probe_yields_none() {
        let payload = serde_json::json!({
            "id": "vod", "url": "https://cdn/vod", "is_live": false
        });
        let parsed: YtDlpInfo = serde_json::from_value(payload).unwrap();
        assert!(select_live_entry(parsed).is_none());
    }
}
