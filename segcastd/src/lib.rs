use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use segcast_core::{
    load_config, Corner, DeliveryQueueStore, DeliveryWorker, ProcessorOptions, RecordingSupervisor,
    SegcastConfig, SegmentProcessor, StreamStore, SupervisorCommand, TaskStatus, TelegramDelivery,
    Transcoder, YtDlpDiscovery,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] segcast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] segcast_core::StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] segcast_core::QueueError),
    #[error("delivery error: {0}")]
    Delivery(#[from] segcast_core::DeliveryError),
    #[error("invalid watermark corner: {0}")]
    InvalidCorner(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live stream capture, watermarking and delivery pipeline", long_about = None)]
pub struct Cli {
    /// Path to segcast.toml
    #[arg(long, default_value = "configs/segcast.toml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the recording supervisor (reads operator commands from stdin)
    Record,
    /// Run the segment processor
    Process,
    /// Run the delivery worker
    Publish,
    /// Print a snapshot of store and queue state
    Status,
}

pub async fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Record => run_recorder(config).await,
        Commands::Process => run_processor(config).await,
        Commands::Publish => run_publisher(config).await,
        Commands::Status => print_status(&config),
    }
}

async fn run_recorder(config: SegcastConfig) -> Result<()> {
    let budget = config.segment_budget()?;
    let discovery = Arc::new(YtDlpDiscovery::new(
        config.recorder.ytdlp_path.clone(),
        config.recorder.cookies_file.clone(),
    ));
    let supervisor =
        RecordingSupervisor::new(config.recorder, config.channels, budget, discovery);

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match SupervisorCommand::parse(&line) {
                Ok(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(usage) => warn!("{usage}"),
            }
        }
    });

    supervisor.run(rx).await;
    Ok(())
}

async fn run_processor(config: SegcastConfig) -> Result<()> {
    let streams = StreamStore::new(&config.store.path)?;
    streams.initialize()?;
    let queue = DeliveryQueueStore::new(&config.store.path)?;
    queue.initialize()?;

    let corner: Corner = config
        .processor
        .watermark_corner
        .parse()
        .map_err(AppError::InvalidCorner)?;
    let options = ProcessorOptions {
        recording_root: config.recorder.output_dir.clone(),
        inactivity: Duration::from_secs(config.processor.inactivity_seconds),
        watermark: config.processor.watermark_path.clone(),
        corner,
    };
    let transcoder = Transcoder::new(config.recorder.ffmpeg_path.clone());
    let processor = SegmentProcessor::new(options, transcoder, streams, queue);
    processor
        .run(Duration::from_secs(config.processor.scan_interval_seconds))
        .await;
    Ok(())
}

async fn run_publisher(config: SegcastConfig) -> Result<()> {
    let queue = DeliveryQueueStore::new(&config.store.path)?;
    queue.initialize()?;
    let delivery = Arc::new(TelegramDelivery::new(
        config.telegram.api_url.clone(),
        config.telegram.bot_token.clone(),
    )?);
    let worker = DeliveryWorker::new(queue, delivery, config.telegram);
    worker.run().await;
    Ok(())
}

fn print_status(config: &SegcastConfig) -> Result<()> {
    let streams = StreamStore::builder()
        .path(&config.store.path)
        .read_only(true)
        .create_if_missing(false)
        .build()?;
    match streams.stream_count() {
        Ok(count) => println!("streams: {count}"),
        Err(err) => println!("streams: unavailable ({err})"),
    }

    let queue = DeliveryQueueStore::builder()
        .path(&config.store.path)
        .read_only(true)
        .create_if_missing(false)
        .build()?;
    match queue.counts() {
        Ok(counts) => {
            for status in [
                TaskStatus::Pending,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                println!("queue {status}: {}", counts.get(&status).copied().unwrap_or(0));
            }
        }
        Err(err) => println!("queue: unavailable ({err})"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use segcast_core::{
        ProcessorSection, RecorderSection, StoreSection, StreamStore, TelegramSection,
    };
    use tempfile::TempDir;

    fn config(dir: &std::path::Path) -> SegcastConfig {
        SegcastConfig {
            recorder: RecorderSection {
                output_dir: dir.join("recordings"),
                check_interval_seconds: 60,
                segment_bytes: None,
                segment_seconds: 1800,
                stop_grace_seconds: 5,
                ytdlp_path: PathBuf::from("yt-dlp"),
                ffmpeg_path: PathBuf::from("ffmpeg"),
                cookies_file: None,
            },
            store: StoreSection {
                path: dir.join("segcast.sqlite"),
            },
            processor: ProcessorSection {
                scan_interval_seconds: 10,
                inactivity_seconds: 60,
                watermark_path: None,
                watermark_corner: "bottom-right".into(),
            },
            telegram: TelegramSection {
                api_url: "https://api.telegram.org".into(),
                bot_token: "000000:test-token".into(),
                chat_id: "@main".into(),
                chat_id_original: "@premium".into(),
                caption_template: "Part {sequence_number}".into(),
                caption_template_original: "Original part {sequence_number}".into(),
                poll_interval_seconds: 5,
            },
            channels: Vec::new(),
        }
    }

    #[test]
    fn status_reads_an_initialized_store() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());

        let streams = StreamStore::new(&config.store.path).unwrap();
        streams.initialize().unwrap();
        let queue = DeliveryQueueStore::new(&config.store.path).unwrap();
        queue.initialize().unwrap();

        print_status(&config).unwrap();
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["segcastd", "--config", "custom.toml", "status"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert!(matches!(cli.command, Commands::Status));

        assert!(Cli::try_parse_from(["segcastd"]).is_err());
    }
}
