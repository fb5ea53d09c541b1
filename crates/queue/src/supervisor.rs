//! Encode queue supervisor
//!
//! Owns the ordered job collection and drives the jobs through the encoder one
//! at a time on a single background task. Status and state changes are pushed
//! to a [`StatusObserver`].

use crate::config::{Config, QueueConfig};
use crate::encode::{
    EncodeProcess, RunHandle, RunState, STATUS_CANCELLED, STATUS_DONE, STATUS_FAILED,
};
use crate::jobs::{EncodeSettings, JobDescriptor, JobId, JobState, SettingsError};
use crate::probe::{self, Capabilities, EncoderTool, ProbeError};
use crate::progress::ProgressParser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Status of a job that has not been picked up yet
pub const STATUS_WAITING: &str = "waiting...";

/// Status of a job whose encoder has just been started
pub const STATUS_STARTED: &str = "encoding";

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The encoder could not be probed or could not describe an input
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Settings the encoder cannot honour
    #[error("Invalid encode settings: {0}")]
    Settings(#[from] SettingsError),

    /// The job id is not (or no longer) in the queue
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// The supervisor was created outside a tokio runtime
    #[error("Queue supervisor must be created inside a tokio runtime")]
    NoRuntime,
}

/// Receives queue notifications
///
/// Called from the worker task, never while the job collection is locked.
/// Implementations that drive a UI must hop onto the UI thread themselves.
pub trait StatusObserver: Send + Sync {
    /// The human-readable status of `id` changed
    fn on_status_changed(&self, id: JobId, status: &str);

    /// The lifecycle state of `id` changed
    fn on_state_changed(&self, _id: JobId, _state: JobState) {}

    /// The worker ran out of jobs, or stopped after a shutdown
    fn on_queue_idle(&self) {}
}

/// Point-in-time view of one queued job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub label: String,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub state: JobState,
    pub status: String,
}

#[derive(Debug)]
struct JobEntry {
    descriptor: JobDescriptor,
    state: JobState,
    status: String,
    run: Option<RunHandle>,
    /// Delete once the worker has recorded the outcome
    removing: bool,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.descriptor.id,
            label: self.descriptor.display_label.clone(),
            input_path: self.descriptor.input_path.clone(),
            output_path: self.descriptor.output_path.clone(),
            state: self.state,
            status: self.status.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct JobTable {
    entries: Vec<JobEntry>,
    next_id: u64,
    running: bool,
    selection: Option<usize>,
}

impl JobTable {
    fn position(&self, id: JobId) -> Option<usize> {
        self.entries.iter().position(|e| e.descriptor.id == id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut JobEntry> {
        self.entries.iter_mut().find(|e| e.descriptor.id == id)
    }

    /// Mark the first waiting job as encoding and hand it to the worker
    fn claim_next(&mut self) -> Option<(JobDescriptor, RunHandle)> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.state == JobState::Waiting)?;
        let handle = RunHandle::new();
        entry.state = JobState::Encoding;
        entry.status = STATUS_STARTED.to_string();
        entry.run = Some(handle.clone());
        Some((entry.descriptor.clone(), handle))
    }

    /// Remove `id` now, or flag it for removal when its run ends
    ///
    /// The state check and the removal happen under one lock, so a job the
    /// worker claims concurrently is always cancelled.
    fn begin_remove(&mut self, id: JobId) -> Result<Removal, SupervisorError> {
        let idx = self.position(id).ok_or(SupervisorError::JobNotFound(id))?;
        let entry = &mut self.entries[idx];
        if entry.state == JobState::Encoding {
            if let Some(run) = entry.run.clone() {
                entry.removing = true;
                return Ok(Removal::AfterRun(run));
            }
        }
        self.remove_at(idx);
        Ok(Removal::Done)
    }

    fn remove_at(&mut self, idx: usize) {
        self.entries.remove(idx);
        self.selection = match self.selection {
            _ if self.entries.is_empty() => None,
            Some(sel) if sel > idx => Some(sel - 1),
            Some(sel) => Some(sel.min(self.entries.len() - 1)),
            None => None,
        };
    }
}

enum Removal {
    Done,
    AfterRun(RunHandle),
}

struct Shared {
    tool: EncoderTool,
    capabilities: Capabilities,
    config: QueueConfig,
    observer: Arc<dyn StatusObserver>,
    quit: AtomicBool,
    table: Mutex<JobTable>,
    idle: watch::Sender<bool>,
    /// Bumped every time the worker records the outcome of a run
    settled: watch::Sender<u64>,
}

impl Shared {
    fn lock_table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new status and notify, unless it did not change
    fn set_status(&self, id: JobId, status: String) {
        {
            let mut table = self.lock_table();
            match table.get_mut(id) {
                Some(entry) if entry.status != status => entry.status = status.clone(),
                _ => return,
            }
        }
        self.observer.on_status_changed(id, &status);
    }

    /// Record the outcome of a run
    fn finish(&self, id: JobId, state: JobState, status: String) {
        let status_changed = {
            let mut table = self.lock_table();
            match table.position(id) {
                Some(idx) => {
                    let entry = &mut table.entries[idx];
                    entry.state = state;
                    entry.run = None;
                    let changed = entry.status != status;
                    entry.status = status.clone();
                    if entry.removing {
                        table.remove_at(idx);
                        debug!("Removed job {}", id);
                    }
                    changed
                }
                None => {
                    debug!("Job {} was removed before it finished", id);
                    true
                }
            }
        };

        info!("Job {} {}: {}", id, state, status);
        self.observer.on_state_changed(id, state);
        if status_changed {
            self.observer.on_status_changed(id, &status);
        }
        self.settled.send_modify(|count| *count += 1);
    }

    /// Sequential worker: one job at a time, in insertion order
    async fn run_queue(self: Arc<Self>) {
        info!("Encoding queue started");
        loop {
            let next = {
                let mut table = self.lock_table();
                let next = if self.quit.load(Ordering::SeqCst) {
                    None
                } else {
                    table.claim_next()
                };
                if next.is_none() {
                    table.running = false;
                    self.idle.send_replace(true);
                }
                next
            };

            let Some((job, handle)) = next else {
                break;
            };

            self.observer.on_state_changed(job.id, JobState::Encoding);
            self.observer.on_status_changed(job.id, STATUS_STARTED);
            self.encode_one(job, handle).await;
        }
        info!("Encoding queue idle");
        self.observer.on_queue_idle();
    }

    async fn encode_one(&self, job: JobDescriptor, handle: RunHandle) {
        info!("Encoding job {} ({})", job.id, job.input_path.display());

        let (state, status) = match EncodeProcess::start(&self.tool, &job, &handle) {
            Err(e) => {
                warn!("Job {}: {}", job.id, e);
                (JobState::Failed, STATUS_FAILED.to_string())
            }
            Ok(process) => {
                let parser = ProgressParser::new(self.config.warning_debounce());
                let id = job.id;
                let result = process
                    .run(parser, |status| self.set_status(id, status))
                    .await;

                if result.success {
                    (JobState::Done, STATUS_DONE.to_string())
                } else if handle.state() == RunState::Cancelled {
                    (JobState::Cancelled, STATUS_CANCELLED.to_string())
                } else {
                    (JobState::Failed, result.final_status)
                }
            }
        };

        self.finish(job.id, state, status);
    }
}

/// Drives queued jobs through the encoder, one at a time
///
/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct QueueSupervisor {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl std::fmt::Debug for QueueSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSupervisor")
            .field("tool", &self.shared.tool)
            .field("capabilities", &self.shared.capabilities)
            .field("running", &self.is_running())
            .finish()
    }
}

impl QueueSupervisor {
    /// Create a supervisor for an already probed tool
    ///
    /// Must be called from within a tokio runtime; the worker task is spawned
    /// on that runtime even when later calls come from other threads.
    pub fn new(
        tool: EncoderTool,
        capabilities: Capabilities,
        config: QueueConfig,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<Self, SupervisorError> {
        let runtime = Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;
        let (idle, _) = watch::channel(true);
        let (settled, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                tool,
                capabilities,
                config,
                observer,
                quit: AtomicBool::new(false),
                table: Mutex::new(JobTable::default()),
                idle,
                settled,
            }),
            runtime,
        })
    }

    /// Locate and probe the encoder, then create the supervisor
    ///
    /// Fails with [`ProbeError::ToolUnavailable`] before any job can be added
    /// if the encoder cannot be run.
    pub async fn initialize(
        config: &Config,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<Self, SupervisorError> {
        let tool = EncoderTool::from_config(&config.encoder);
        let capabilities = probe::probe(&tool).await?;
        Self::new(tool, capabilities, config.queue.clone(), observer)
    }

    /// Capabilities the encoder reported at startup
    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    pub fn tool(&self) -> &EncoderTool {
        &self.shared.tool
    }

    /// Append a job with ready-made encoder options
    pub fn add_job(
        &self,
        input_path: PathBuf,
        output_path: Option<PathBuf>,
        options: Vec<String>,
    ) -> JobId {
        let id = {
            let mut table = self.shared.lock_table();
            let id = JobId(table.next_id);
            table.next_id += 1;

            let descriptor = JobDescriptor::new(
                id,
                input_path,
                output_path,
                options,
                self.shared.config.label_max_chars,
            );
            table.entries.push(JobEntry {
                descriptor,
                state: JobState::Waiting,
                status: STATUS_WAITING.to_string(),
                run: None,
                removing: false,
            });
            if table.entries.len() == 1 {
                table.selection = Some(0);
            }
            id
        };

        debug!("Queued job {}", id);
        self.shared.observer.on_status_changed(id, STATUS_WAITING);
        id
    }

    /// Validate, describe and queue an input file
    ///
    /// The job is only added if the settings fit the encoder and the encoder
    /// can read the input.
    pub async fn add_video(
        &self,
        input_path: PathBuf,
        output_path: Option<PathBuf>,
        settings: &EncodeSettings,
    ) -> Result<JobId, SupervisorError> {
        settings.validate(&self.shared.capabilities)?;

        let info = probe::file_info(&self.shared.tool, &input_path).await?;
        debug!(
            duration = ?info.duration(),
            video = info.has_video(),
            audio = info.has_audio(),
            "Read file info for {}",
            input_path.display()
        );

        Ok(self.add_job(input_path, output_path, settings.to_options()))
    }

    /// Remove a job, cancelling its encoder first if it is running
    ///
    /// An encoding job is removed by the worker once it has reported the
    /// cancelled run; this resolves after that.
    pub async fn remove_job(&self, id: JobId) -> Result<(), SupervisorError> {
        let mut settled = self.shared.settled.subscribe();
        let run = match self.shared.lock_table().begin_remove(id)? {
            Removal::Done => {
                debug!("Removed job {}", id);
                return Ok(());
            }
            Removal::AfterRun(run) => run,
        };

        info!("Cancelling job {} before removing it", id);
        run.cancel(self.shared.config.cancel_grace()).await;

        // Only fails if the sender is gone, and `self` holds it
        let _ = settled
            .wait_for(|_| self.shared.lock_table().position(id).is_none())
            .await;
        Ok(())
    }

    /// Start the background worker; returns false if it is already running
    /// or the supervisor has been shut down
    pub fn start_encoding(&self) -> bool {
        if self.shared.quit.load(Ordering::SeqCst) {
            return false;
        }

        let mut table = self.shared.lock_table();
        if table.running {
            return false;
        }
        table.running = true;
        self.shared.idle.send_replace(false);
        drop(table);

        self.runtime.spawn(Arc::clone(&self.shared).run_queue());
        true
    }

    /// Cancel a job's encoder; a job that is not encoding is left alone
    pub async fn cancel_job(&self, id: JobId) -> Result<(), SupervisorError> {
        let run = {
            let table = self.shared.lock_table();
            let idx = table.position(id).ok_or(SupervisorError::JobNotFound(id))?;
            let entry = &table.entries[idx];
            match entry.state {
                JobState::Encoding => entry.run.clone(),
                _ => None,
            }
        };

        if let Some(run) = run {
            info!("Cancelling job {}", id);
            run.cancel(self.shared.config.cancel_grace()).await;
        }
        Ok(())
    }

    /// Stop the queue
    ///
    /// Sets the quit flag, cancels every running encoder and waits for the
    /// worker to stop. Waiting jobs stay queued.
    pub async fn shutdown(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);

        let runs: Vec<(JobId, RunHandle)> = {
            let table = self.shared.lock_table();
            table
                .entries
                .iter()
                .filter_map(|e| e.run.clone().map(|run| (e.descriptor.id, run)))
                .collect()
        };

        let grace = self.shared.config.cancel_grace();
        for (id, run) in runs {
            info!("Shutdown: cancelling job {}", id);
            run.cancel(grace).await;
        }

        self.wait_until_idle().await;
        info!("Queue supervisor stopped");
    }

    /// Shut down after asking for confirmation if a job is still encoding
    ///
    /// Returns false, leaving everything running, when `confirm` declines.
    pub async fn request_close<F>(&self, confirm: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        if self.has_encoding_job() && !confirm() {
            debug!("Close declined while encoding");
            return false;
        }
        self.shutdown().await;
        true
    }

    /// Resolve once the worker has stopped
    pub async fn wait_until_idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        // Only fails if the sender is gone, and `self` holds it
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Whether the worker task is active
    pub fn is_running(&self) -> bool {
        self.shared.lock_table().running
    }

    /// Whether `id` is currently encoding
    pub fn is_encoding(&self, id: JobId) -> bool {
        let table = self.shared.lock_table();
        table
            .position(id)
            .map_or(false, |idx| table.entries[idx].state == JobState::Encoding)
    }

    fn has_encoding_job(&self) -> bool {
        self.shared
            .lock_table()
            .entries
            .iter()
            .any(|e| e.state == JobState::Encoding)
    }

    /// All jobs in queue order
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.shared
            .lock_table()
            .entries
            .iter()
            .map(JobEntry::snapshot)
            .collect()
    }

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        let table = self.shared.lock_table();
        table.position(id).map(|idx| table.entries[idx].snapshot())
    }

    /// Index of the selected job
    pub fn selected(&self) -> Option<usize> {
        self.shared.lock_table().selection
    }

    /// Select the job at `index`; returns false if out of range
    pub fn select(&self, index: usize) -> bool {
        let mut table = self.shared.lock_table();
        if index < table.entries.len() {
            table.selection = Some(index);
            true
        } else {
            false
        }
    }
}
