use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TelegramSection;
use crate::queue::{DeliveryQueueStore, DeliveryTask, QueueError, RenditionKind};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload failed: {0}")]
    Upload(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// The one operation the delivery collaborator exposes: upload a video
/// with a caption to a named destination.
#[async_trait::async_trait]
pub trait VideoDelivery: Send + Sync {
    async fn send_video(
        &self,
        file: &Path,
        caption: &str,
        destination: &str,
    ) -> DeliveryResult<()>;
}

pub struct TelegramDelivery {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
}

impl TelegramDelivery {
    pub fn new(api_url: String, bot_token: String) -> DeliveryResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("segcast-publisher/0.1")
            .build()
            .map_err(|err| DeliveryError::Upload(err.to_string()))?;
        Ok(Self {
            client,
            api_url,
            bot_token,
        })
    }
}

#[async_trait::async_trait]
impl VideoDelivery for TelegramDelivery {
    async fn send_video(
        &self,
        file: &Path,
        caption: &str,
        destination: &str,
    ) -> DeliveryResult<()> {
        let url = format!("{}/bot{}/sendVideo", self.api_url, self.bot_token);
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "video.mp4".to_string());
        let bytes = tokio::fs::read(file).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("video/mp4")
            .map_err(|err| DeliveryError::Upload(err.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", destination.to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .text("supports_streaming", "true")
            .part("video", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| DeliveryError::Upload(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Upload(format!("{status}: {body}")))
        }
    }
}

/// Substitutes `{field}` placeholders from the task's metadata snapshot
/// plus `sequence_number`. Unresolved placeholders are left verbatim so a
/// sparse snapshot can never fail a delivery.
pub fn render_caption(template: &str, info: &serde_json::Value, sequence_number: i64) -> String {
    let mut fields: HashMap<String, String> = HashMap::new();
    if let Some(object) = info.as_object() {
        for (key, value) in object {
            let rendered = match value {
                serde_json::Value::String(text) => text.clone(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            fields.insert(key.clone(), rendered);
        }
    }
    fields.insert("sequence_number".to_string(), sequence_number.to_string());

    placeholder_pattern()
        .replace_all(template, |captures: &regex::Captures<'_>| {
            fields
                .get(&captures[1])
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned()
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Failed,
}

pub struct DeliveryWorker {
    queue: DeliveryQueueStore,
    delivery: Arc<dyn VideoDelivery>,
    telegram: TelegramSection,
}

impl DeliveryWorker {
    pub fn new(
        queue: DeliveryQueueStore,
        delivery: Arc<dyn VideoDelivery>,
        telegram: TelegramSection,
    ) -> Self {
        Self {
            queue,
            delivery,
            telegram,
        }
    }

    /// Claims and delivers a single task. `Ok(None)` means nothing was
    /// claimable.
    pub async fn run_once(&self) -> DeliveryResult<Option<(DeliveryTask, DeliveryOutcome)>> {
        let Some(task) = self.queue.claim()? else {
            return Ok(None);
        };
        info!(
            task = task.id,
            stream_id = %task.stream_id,
            sequence = task.sequence_number,
            kind = %task.target_type,
            "delivering task"
        );

        let (template, destination) = match task.target_type {
            RenditionKind::Watermarked => {
                (&self.telegram.caption_template, &self.telegram.chat_id)
            }
            RenditionKind::Original => (
                &self.telegram.caption_template_original,
                &self.telegram.chat_id_original,
            ),
        };
        let caption = render_caption(template, &task.info, task.sequence_number);

        let file = Path::new(&task.file_path);
        if !file.exists() {
            warn!(task = task.id, path = %task.file_path, "delivery file not found");
            self.queue.mark_failed(task.id, "file not found")?;
            return Ok(Some((task, DeliveryOutcome::Failed)));
        }

        match self.delivery.send_video(file, &caption, destination).await {
            Ok(()) => {
                self.queue.mark_completed(task.id)?;
                info!(task = task.id, "delivery completed");
                Ok(Some((task, DeliveryOutcome::Completed)))
            }
            Err(err) => {
                warn!(task = task.id, error = %err, "delivery failed");
                self.queue.mark_failed(task.id, &err.to_string())?;
                Ok(Some((task, DeliveryOutcome::Failed)))
            }
        }
    }

    /// Claim loop with a fixed back-off when the queue is empty. Store
    /// errors are logged and retried on the next iteration, never fatal.
    pub async fn run(&self) {
        let idle = Duration::from_secs(self.telegram.poll_interval_seconds);
        loop {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("no pending deliveries");
                    tokio::time::sleep(idle).await;
                }
                Err(err) => {
                    warn!(error = %err, "delivery iteration failed");
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_substitutes_known_fields() {
        let info = serde_json::json!({
            "title": "Launch stream",
            "uploader": "channel-a",
            "viewers": 1200
        });
        let caption = render_caption("<b>{title}</b> by {uploader}, part {sequence_number}", &info, 3);
        assert_eq!(caption, "<b>Launch stream</b> by channel-a, part 3");

        let with_number = render_caption("{viewers} watching", &info, 1);
        assert_eq!(with_number, "1200 watching");
    }

    #[test]
    fn unresolved_placeholders_stay_verbatim() {
        let info = serde_json::json!({ "title": "T" });
        let caption = render_caption("{title} / {nonexistent} / part {sequence_number}", &info, 2);
        assert_eq!(caption, "T / {nonexistent} / part 2");
    }

    #[test]
    fn null_fields_are_treated_as_missing() {
        let info = serde_json::json!({ "title": null });
        assert_eq!(render_caption("{title}", &info, 1), "{title}");
    }

    #[test]
    fn repeated_renders_are_consistent() {
        let info = serde_json::json!({ "title": "T" });
        for sequence in 1..=3 {
            assert_eq!(
                render_caption("{title} part {sequence_number}", &info, sequence),
                format!("T part {sequence}")
            );
        }
    }

    #[test]
    fn caption_handles_non_object_snapshot() {
        assert_eq!(
            render_caption("part {sequence_number}", &serde_json::Value::Null, 9),
            "part 9"
        );
    }
}
