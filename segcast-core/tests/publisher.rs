use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use segcast_core::{
    DeliveryError, DeliveryOutcome, DeliveryQueueStore, DeliveryResult, DeliveryWorker, NewTask,
    RenditionKind, TaskFilter, TaskStatus, TelegramSection, VideoDelivery,
};

#[derive(Default)]
struct RecordingDelivery {
    sent: Mutex<Vec<(PathBuf, String, String)>>,
    fail_with: Option<String>,
}

impl RecordingDelivery {
    fn failing(reason: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl VideoDelivery for RecordingDelivery {
    async fn send_video(
        &self,
        file: &Path,
        caption: &str,
        destination: &str,
    ) -> DeliveryResult<()> {
        if let Some(reason) = &self.fail_with {
            return Err(DeliveryError::Upload(reason.clone()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((file.to_path_buf(), caption.to_string(), destination.to_string()));
        Ok(())
    }
}

fn telegram_section() -> TelegramSection {
    TelegramSection {
        api_url: "https://api.telegram.org".into(),
        bot_token: "123:abc".into(),
        chat_id: "@segcast_main".into(),
        chat_id_original: "@segcast_premium".into(),
        caption_template: "<b>{title}</b> part {sequence_number}".into(),
        caption_template_original: "{title} (original) part {sequence_number}".into(),
        poll_interval_seconds: 1,
    }
}

struct Bench {
    _dir: TempDir,
    queue: DeliveryQueueStore,
    video: PathBuf,
}

impl Bench {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let queue = DeliveryQueueStore::new(dir.path().join("segcast.sqlite")).unwrap();
        queue.initialize().unwrap();
        let video = dir.path().join("video_000.mp4");
        std::fs::write(&video, b"mp4 bytes").unwrap();
        Self {
            _dir: dir,
            queue,
            video,
        }
    }

    fn enqueue(&self, kind: RenditionKind, file_path: &str) {
        self.queue
            .enqueue(&NewTask {
                stream_id: "s1".into(),
                sequence_number: 4,
                file_path: file_path.into(),
                info: serde_json::json!({ "title": "Launch" }),
                target_type: kind,
            })
            .unwrap();
    }

    fn task_status(&self, status: TaskStatus) -> usize {
        self.queue
            .list(&TaskFilter {
                status: Some(status),
                limit: None,
            })
            .unwrap()
            .len()
    }
}

#[tokio::test]
async fn delivers_watermarked_task_to_main_channel() {
    let bench = Bench::new();
    bench.enqueue(RenditionKind::Watermarked, &bench.video.to_string_lossy());

    let delivery = Arc::new(RecordingDelivery::default());
    let worker = DeliveryWorker::new(bench.queue.clone(), delivery.clone(), telegram_section());

    let (task, outcome) = worker.run_once().await.unwrap().expect("claimed a task");
    assert_eq!(outcome, DeliveryOutcome::Completed);
    assert_eq!(task.target_type, RenditionKind::Watermarked);

    let sent = delivery.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (file, caption, destination) = &sent[0];
    assert_eq!(file, &bench.video);
    assert_eq!(caption, "<b>Launch</b> part 4");
    assert_eq!(destination, "@segcast_main");
    drop(sent);

    assert_eq!(bench.task_status(TaskStatus::Completed), 1);
}

#[tokio::test]
async fn original_rendition_uses_its_own_template_and_channel() {
    let bench = Bench::new();
    bench.enqueue(RenditionKind::Original, &bench.video.to_string_lossy());

    let delivery = Arc::new(RecordingDelivery::default());
    let worker = DeliveryWorker::new(bench.queue.clone(), delivery.clone(), telegram_section());

    worker.run_once().await.unwrap().expect("claimed a task");

    let sent = delivery.sent.lock().unwrap();
    let (_, caption, destination) = &sent[0];
    assert_eq!(caption, "Launch (original) part 4");
    assert_eq!(destination, "@segcast_premium");
}

#[tokio::test]
async fn missing_file_fails_without_calling_delivery() {
    let bench = Bench::new();
    bench.enqueue(RenditionKind::Watermarked, "/nonexistent/video_000.mp4");

    let delivery = Arc::new(RecordingDelivery::default());
    let worker = DeliveryWorker::new(bench.queue.clone(), delivery.clone(), telegram_section());

    let (_, outcome) = worker.run_once().await.unwrap().expect("claimed a task");
    assert_eq!(outcome, DeliveryOutcome::Failed);
    assert!(delivery.sent.lock().unwrap().is_empty());

    let failed = bench
        .queue
        .list(&TaskFilter {
            status: Some(TaskStatus::Failed),
            limit: None,
        })
        .unwrap();
    assert_eq!(failed[0].error.as_deref(), Some("file not found"));
}

#[tokio::test]
async fn upload_failure_records_the_reason() {
    let bench = Bench::new();
    bench.enqueue(RenditionKind::Watermarked, &bench.video.to_string_lossy());

    let delivery = Arc::new(RecordingDelivery::failing("telegram said no"));
    let worker = DeliveryWorker::new(bench.queue.clone(), delivery, telegram_section());

    let (_, outcome) = worker.run_once().await.unwrap().expect("claimed a task");
    assert_eq!(outcome, DeliveryOutcome::Failed);

    let failed = bench
        .queue
        .list(&TaskFilter {
            status: Some(TaskStatus::Failed),
            limit: None,
        })
        .unwrap();
    assert_eq!(
        failed[0].error.as_deref(),
        Some("upload failed: telegram said no")
    );
}

#[tokio::test]
async fn empty_queue_claims_nothing() {
    let bench = Bench::new();
    let worker = DeliveryWorker::new(
        bench.queue.clone(),
        Arc::new(RecordingDelivery::default()),
        telegram_section(),
    );
    assert!(worker.run_once().await.unwrap().is_none());
}
