//! Theora encode queue
//!
//! Queues video files and drives the external `ffmpeg2theora` encoder over
//! them one at a time, reporting per-job progress to an observer.

pub mod encode;
pub mod jobs;
pub mod probe;
pub mod progress;
pub mod supervisor;

#[cfg(all(test, unix))]
mod test_support;

pub use encode::{
    build_encoder_command, EncodeError, EncodeProcess, EncodeResult, RunHandle, RunState,
};
pub use jobs::{
    display_label, EncodeSettings, JobDescriptor, JobId, JobState, SettingsError, SubtitleTrack,
};
pub use probe::{file_info, probe, Capabilities, EncoderTool, FileInfo, ProbeError};
pub use progress::{ProgressParser, ProgressRecord, ProgressSnapshot};
pub use supervisor::{JobSnapshot, QueueSupervisor, StatusObserver, SupervisorError};
pub use theora_queue_config as config;
pub use theora_queue_config::Config;
