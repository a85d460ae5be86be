pub mod config;
pub mod discovery;
pub mod error;
pub mod exec;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod recorder;
pub mod sidecar;
pub mod sqlite;
pub mod store;
pub mod transcode;

pub use config::{
    load_config, parse_size, ChannelConfig, ProcessorSection, RecorderSection, SegcastConfig,
    StoreSection, TelegramSection,
};
pub use discovery::{DiscoveryError, StreamDiscovery, StreamInfo, YtDlpDiscovery};
pub use error::{ConfigError, Result};
pub use exec::{CommandExecutor, SystemCommandExecutor};
pub use processor::{
    ProcessedSegment, ProcessorError, ProcessorOptions, ProcessorResult, SegmentProcessor,
};
pub use publisher::{
    render_caption, DeliveryError, DeliveryOutcome, DeliveryResult, DeliveryWorker,
    TelegramDelivery, VideoDelivery,
};
pub use queue::{
    DeliveryQueueStore, DeliveryQueueStoreBuilder, DeliveryTask, NewTask, QueueError, QueueResult,
    RenditionKind, TaskFilter, TaskStatus,
};
pub use recorder::{
    RecorderError, RecorderResult, RecordingHandle, RecordingSupervisor, SupervisorCommand,
};
pub use sidecar::{SessionDescriptor, SidecarError, SidecarResult};
pub use store::{StoreError, StoreResult, StreamRecord, StreamStore, StreamStoreBuilder};
pub use transcode::{Corner, TranscodeError, TranscodeResult, Transcoder};
