pub mod writer;

pub use writer::{segment_path, write_segments};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, RecorderSection};
use crate::discovery::{StreamDiscovery, StreamInfo};
use crate::sidecar::SidecarError;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar error: {0}")]
    Sidecar(#[from] SidecarError),
    #[error("recording process has no stdout pipe")]
    MissingStdout,
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Supervised capture for one channel: either a bare ffmpeg process doing
/// its own time-based segmenting, or an ffmpeg process piping into a
/// byte-budget writer task.
pub enum RecordingHandle {
    Process(Child),
    ProcessWithWriter {
        child: Child,
        writer: JoinHandle<std::io::Result<u32>>,
    },
}

impl RecordingHandle {
    fn child_mut(&mut self) -> &mut Child {
        match self {
            RecordingHandle::Process(child) => child,
            RecordingHandle::ProcessWithWriter { child, .. } => child,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child_mut().try_wait(), Ok(None))
    }

    /// Graceful stop: ask ffmpeg to quit (it exits cleanly on `q`), wait
    /// out the grace period, then kill. The writer task drains on its own
    /// once the pipe closes.
    pub async fn terminate(self, grace: Duration) {
        let (mut child, writer) = match self {
            RecordingHandle::Process(child) => (child, None),
            RecordingHandle::ProcessWithWriter { child, writer } => (child, Some(writer)),
        };
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }
        if timeout(grace, child.wait()).await.is_err() {
            warn!("recording process ignored graceful stop, killing");
            let _ = child.kill().await;
        }
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

/// Operator commands accepted over the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    Stop(String),
    Resume(String),
    List,
    Quit,
}

impl SupervisorCommand {
    /// Parses one operator line. `Err` carries a usage message.
    pub fn parse(line: &str) -> Result<Self, String> {
        let trimmed = line.trim();
        let (cmd, rest) = match trimmed.split_once(' ') {
            Some((cmd, rest)) => (cmd, Some(rest.trim())),
            None => (trimmed, None),
        };
        match cmd.to_lowercase().as_str() {
            "stop" => match rest.filter(|name| !name.is_empty()) {
                Some(name) => Ok(Self::Stop(name.to_string())),
                None => Err("usage: stop <channel>".to_string()),
            },
            "resume" => match rest.filter(|name| !name.is_empty()) {
                Some(name) => Ok(Self::Resume(name.to_string())),
                None => Err("usage: resume <channel>".to_string()),
            },
            "list" => Ok(Self::List),
            "quit" => Ok(Self::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

pub struct RecordingSupervisor {
    settings: RecorderSection,
    channels: Vec<ChannelConfig>,
    segment_budget: Option<u64>,
    discovery: Arc<dyn StreamDiscovery>,
    active: HashMap<String, RecordingHandle>,
    stopped: HashSet<String>,
}

impl RecordingSupervisor {
    pub fn new(
        settings: RecorderSection,
        channels: Vec<ChannelConfig>,
        segment_budget: Option<u64>,
        discovery: Arc<dyn StreamDiscovery>,
    ) -> Self {
        Self {
            settings,
            channels,
            segment_budget,
            discovery,
            active: HashMap::new(),
            stopped: HashSet::new(),
        }
    }

    /// Main loop: a fixed-interval poll tick interleaved with operator
    /// commands. Returns once `quit` arrives or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>) {
        let mut ticker = interval(Duration::from_secs(self.settings.check_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_channels().await,
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.stop_all().await;
                        break;
                    }
                }
            }
        }
    }

    async fn poll_channels(&mut self) {
        debug!("polling {} channels", self.channels.len());
        let channels = self.channels.clone();
        for channel in channels {
            match self.discovery.probe(&channel.url).await {
                Ok(Some(info)) => {
                    if let Err(err) = self.start_recording(&channel, &info).await {
                        warn!(channel = %channel.name, error = %err, "failed to start recording");
                    }
                }
                Ok(None) => self.reap_if_dead(&channel.name),
                Err(err) => {
                    warn!(channel = %channel.name, error = %err, "liveness probe failed");
                }
            }
        }
    }

    /// Drops the handle of a writer that exited on its own; the session
    /// and its segments stay on disk for the processor.
    fn reap_if_dead(&mut self, name: &str) {
        if let Some(handle) = self.active.get_mut(name) {
            if !handle.is_alive() {
                info!(channel = %name, "stream ended, recording process exited");
                self.active.remove(name);
            }
        }
    }

    async fn start_recording(
        &mut self,
        channel: &ChannelConfig,
        info: &StreamInfo,
    ) -> RecorderResult<()> {
        if self.stopped.contains(&channel.name) {
            debug!(channel = %channel.name, "channel manually stopped, skipping");
            return Ok(());
        }
        if let Some(handle) = self.active.get_mut(&channel.name) {
            if handle.is_alive() {
                debug!(channel = %channel.name, "recording already running");
                return Ok(());
            }
            info!(channel = %channel.name, "previous recording finished, starting a new one");
            self.active.remove(&channel.name);
        }

        info!(channel = %channel.name, stream_id = %info.id, "channel is live, starting capture");
        let session_dir = self.create_session_dir(&channel.name)?;
        if let Err(err) = info.descriptor().write(&session_dir) {
            // Without the sidecar the processor cannot enqueue deliveries,
            // but the capture itself is still worth keeping.
            warn!(channel = %channel.name, error = %err, "failed to write session sidecar");
        }

        let handle = match self.segment_budget {
            Some(budget) => self.spawn_byte_budget(info, &session_dir, budget)?,
            None => self.spawn_time_budget(info, &session_dir)?,
        };
        self.active.insert(channel.name.clone(), handle);
        Ok(())
    }

    fn create_session_dir(&self, channel_name: &str) -> std::io::Result<PathBuf> {
        let now = Local::now();
        let session_dir = self
            .settings
            .output_dir
            .join(channel_name)
            .join(now.format("%Y-%m-%d").to_string())
            .join(now.format("%H-%M-%S").to_string());
        std::fs::create_dir_all(&session_dir)?;
        Ok(session_dir)
    }

    fn base_command(&self, info: &StreamInfo) -> Command {
        let mut command = Command::new(&self.settings.ffmpeg_path);
        command.arg("-y");
        if let Some(user_agent) = info.http_headers.get("User-Agent") {
            command.arg("-user_agent").arg(user_agent);
        }
        command.arg("-i").arg(&info.media_url);
        command.stderr(Stdio::null());
        command.kill_on_drop(true);
        command
    }

    /// ffmpeg remuxes to a single mpegts pipe and a writer task splits it
    /// by accumulated byte count.
    fn spawn_byte_budget(
        &self,
        info: &StreamInfo,
        session_dir: &PathBuf,
        budget: u64,
    ) -> RecorderResult<RecordingHandle> {
        let mut command = self.base_command(info);
        command
            .arg("-c")
            .arg("copy")
            .arg("-f")
            .arg("mpegts")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or(RecorderError::MissingStdout)?;
        let dir = session_dir.clone();
        let writer =
            tokio::spawn(async move { write_segments(stdout, &dir, budget).await });
        Ok(RecordingHandle::ProcessWithWriter { child, writer })
    }

    /// ffmpeg's own segment muxer handles the rollover, no byte-level
    /// supervision needed.
    fn spawn_time_budget(
        &self,
        info: &StreamInfo,
        session_dir: &PathBuf,
    ) -> RecorderResult<RecordingHandle> {
        let mut command = self.base_command(info);
        command
            .arg("-c")
            .arg("copy")
            .arg("-f")
            .arg("segment")
            .arg("-segment_time")
            .arg(self.settings.segment_seconds.to_string())
            .arg("-reset_timestamps")
            .arg("1")
            .arg(session_dir.join("video_%03d.ts"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null());
        let child = command.spawn()?;
        Ok(RecordingHandle::Process(child))
    }

    /// Returns true when the supervisor should shut down.
    async fn handle_command(&mut self, command: SupervisorCommand) -> bool {
        match command {
            SupervisorCommand::Stop(name) => {
                match self.active.remove(&name) {
                    Some(handle) => {
                        info!(channel = %name, "stopping recording");
                        handle.terminate(self.stop_grace()).await;
                        info!(channel = %name, "recording stopped");
                    }
                    None => warn!(channel = %name, "channel is not recording"),
                }
                self.stopped.insert(name);
                false
            }
            SupervisorCommand::Resume(name) => {
                if self.stopped.remove(&name) {
                    info!(channel = %name, "channel resumed, recording restarts on the next poll");
                } else {
                    warn!(channel = %name, "channel was not manually stopped");
                }
                false
            }
            SupervisorCommand::List => {
                let active: Vec<&String> = self.active.keys().collect();
                let stopped: Vec<&String> = self.stopped.iter().collect();
                info!(?active, ?stopped, "supervisor state");
                false
            }
            SupervisorCommand::Quit => {
                info!("shutting down supervisor");
                self.stop_all().await;
                true
            }
        }
    }

    async fn stop_all(&mut self) {
        let grace = self.stop_grace();
        for (name, handle) in self.active.drain() {
            info!(channel = %name, "stopping recording");
            handle.terminate(grace).await;
        }
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.settings.stop_grace_seconds)
    }
}
