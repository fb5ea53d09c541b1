//! Encoder process driver
//!
//! Builds and runs one `ffmpeg2theora --frontend` invocation, streams its
//! status lines through a [`ProgressParser`] and supports cancellation:
//! SIGTERM first, SIGKILL once the grace period runs out.

use crate::jobs::JobDescriptor;
use crate::probe::EncoderTool;
use crate::progress::ProgressParser;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Makes the encoder print one JSON status record per line on stdout
pub const FRONTEND_FLAG: &str = "--frontend";

/// Final status of a successful run
pub const STATUS_DONE: &str = "encoding done.";

/// Final status of a failed run without a more specific reason
pub const STATUS_FAILED: &str = "encoding failed.";

/// Final status of a cancelled run
pub const STATUS_CANCELLED: &str = "encoding cancelled.";

/// How long to keep reading stdout once the encoder has exited
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one encoder run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeResult {
    /// The encoder reported `{"result": "ok"}`
    pub success: bool,
    /// Status to show once the run is over
    pub final_status: String,
    /// Exit status of the process, if it could be collected
    pub exit_status: Option<ExitStatus>,
}

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Cancelled,
    SpawnFailed,
}

#[derive(Debug)]
struct HandleState {
    pid: Option<u32>,
    run_state: RunState,
    cancel_requested: bool,
}

#[derive(Debug)]
struct HandleInner {
    state: Mutex<HandleState>,
    exited: watch::Sender<bool>,
}

/// Shared cancellation handle for one run
///
/// Created before the process is spawned so a cancel request can never be
/// lost: cancelling a run that has not started yet makes the start kill the
/// child straight away.
#[derive(Debug, Clone)]
pub struct RunHandle {
    inner: Arc<HandleInner>,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    pub fn new() -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(HandleState {
                    pid: None,
                    run_state: RunState::NotStarted,
                    cancel_requested: false,
                }),
                exited,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        self.lock().run_state
    }

    /// Whether cancellation has been requested at any point
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Record the child's pid; returns true if a cancel is already pending
    fn attach(&self, pid: Option<u32>) -> bool {
        let mut state = self.lock();
        state.pid = pid;
        state.run_state = RunState::Running;
        state.cancel_requested
    }

    fn mark_spawn_failed(&self) {
        self.lock().run_state = RunState::SpawnFailed;
        self.inner.exited.send_replace(true);
    }

    fn mark_exited(&self) {
        {
            let mut state = self.lock();
            state.pid = None;
            state.run_state = if state.cancel_requested {
                RunState::Cancelled
            } else {
                RunState::Completed
            };
        }
        self.inner.exited.send_replace(true);
    }

    /// Ask the encoder to stop
    ///
    /// Sends SIGTERM, waits up to `grace` for the process to exit and sends
    /// SIGKILL if it is still alive. Safe to call any number of times, before
    /// the process started or after it finished; signalling errors are logged
    /// and swallowed.
    pub async fn cancel(&self, grace: Duration) {
        let pid = {
            let mut state = self.lock();
            state.cancel_requested = true;
            match state.run_state {
                RunState::Running => state.pid,
                _ => None,
            }
        };

        let Some(pid) = pid else {
            debug!("Cancel requested for an encoder that is not running");
            return;
        };

        info!(pid, "Terminating encoder");
        send_signal(pid, false).await;

        let mut exited = self.inner.exited.subscribe();
        if tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok()
        {
            return;
        }

        if self.state() == RunState::Running {
            warn!(pid, "Encoder still running after {:?}, killing it", grace);
            send_signal(pid, true).await;
        }
    }
}

#[cfg(unix)]
async fn send_signal(pid: u32, force: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, "Failed to send {:?}: {}", signal, e);
    }
}

#[cfg(windows)]
async fn send_signal(pid: u32, force: bool) {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    if let Err(e) = cmd.status().await {
        debug!(pid, "taskkill failed: {}", e);
    }
}

/// Build the encoder command for a job
///
/// Arguments are `--frontend`, the job's options, the input path and, when
/// set, `-o <output>`. Stdout is captured, stdin and stderr are discarded.
pub fn build_encoder_command(tool: &EncoderTool, job: &JobDescriptor) -> Command {
    let mut cmd = tool.command();

    cmd.arg(FRONTEND_FLAG);
    cmd.args(&job.options);
    cmd.arg(&job.input_path);
    if let Some(output) = &job.output_path {
        cmd.arg("-o").arg(output);
    }

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// A started encoder process
#[derive(Debug)]
pub struct EncodeProcess {
    child: Child,
    stdout: ChildStdout,
    handle: RunHandle,
    name: String,
}

impl EncodeProcess {
    /// Spawn the encoder for `job`, attaching it to `handle`
    pub fn start(
        tool: &EncoderTool,
        job: &JobDescriptor,
        handle: &RunHandle,
    ) -> Result<Self, EncodeError> {
        let spawn_error = |source: std::io::Error| {
            handle.mark_spawn_failed();
            EncodeError::Spawn {
                program: tool.program().to_path_buf(),
                source,
            }
        };

        let mut child = build_encoder_command(tool, job).spawn().map_err(spawn_error)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.start_kill();
                return Err(spawn_error(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "encoder stdout was not captured",
                )));
            }
        };

        let name = job.name();
        let pid = child.id();
        info!(pid, "Started encoder for {}", name);

        if handle.attach(pid) {
            debug!("Cancel was requested before {} started", name);
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill encoder for {}: {}", name, e);
            }
        }

        Ok(Self {
            child,
            stdout,
            handle: handle.clone(),
            name,
        })
    }

    /// Stream the encoder's output until it exits
    ///
    /// Every line goes through `parser`; status changes are passed to
    /// `on_status`. Success requires the encoder to have reported
    /// `{"result": "ok"}`, whatever its exit code.
    pub async fn run<F>(self, mut parser: ProgressParser, mut on_status: F) -> EncodeResult
    where
        F: FnMut(String),
    {
        let EncodeProcess {
            mut child,
            stdout,
            handle,
            name,
        } = self;

        let read_lines = async {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        if let Some(status) = parser.parse_line(&line) {
                            on_status(status);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read encoder output for {}: {}", name, e);
                        break;
                    }
                }
            }
        };

        let wait_exit = async {
            let status = child.wait().await;
            handle.mark_exited();
            status
        };

        let exit = {
            tokio::pin!(read_lines);
            tokio::pin!(wait_exit);
            tokio::select! {
                exit = &mut wait_exit => {
                    // A descendant may still hold the pipe open
                    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut read_lines)
                        .await
                        .is_err()
                    {
                        debug!("Output of {} still open after exit, not waiting", name);
                    }
                    exit
                }
                () = &mut read_lines => (&mut wait_exit).await,
            }
        };

        let exit_status = match exit {
            Ok(status) => {
                debug!("Encoder for {} exited with {}", name, status);
                Some(status)
            }
            Err(e) => {
                warn!("Failed to wait for encoder of {}: {}", name, e);
                None
            }
        };

        let snapshot = parser.into_snapshot();
        let success = snapshot.succeeded();
        let final_status = if success {
            STATUS_DONE.to_string()
        } else {
            snapshot
                .failure_detail()
                .unwrap_or(STATUS_FAILED)
                .to_string()
        };

        EncodeResult {
            success,
            final_status,
            exit_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{EncodeSettings, JobId, SubtitleTrack, DEFAULT_LABEL_MAX_CHARS};
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn make_job(input: &str, output: Option<&str>, options: Vec<String>) -> JobDescriptor {
        JobDescriptor::new(
            JobId(1),
            PathBuf::from(input),
            output.map(PathBuf::from),
            options,
            DEFAULT_LABEL_MAX_CHARS,
        )
    }

    // Strategy for generating valid path-like strings
    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("[a-zA-Z0-9_/.-]{1,50}")
            .unwrap()
            .prop_filter("non-empty path", |s| !s.is_empty())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_command_layout(
            input in path_strategy(),
            output in proptest::option::of(path_strategy()),
            width in proptest::option::of(1u32..4000),
            tracks in 0usize..3,
        ) {
            let settings = EncodeSettings {
                width,
                subtitles: (0..tracks).map(|i| SubtitleTrack::new(format!("s{}.srt", i))).collect(),
                ..Default::default()
            };
            let options = settings.to_options();
            let job = make_job(&input, output.as_deref(), options.clone());
            let tool = EncoderTool::new("ffmpeg2theora");

            let cmd = build_encoder_command(&tool, &job);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), std::ffi::OsStr::new("ffmpeg2theora"));

            let mut expected = vec![FRONTEND_FLAG.to_string()];
            expected.extend(options);
            expected.push(input.clone());
            if let Some(out) = &output {
                expected.push("-o".to_string());
                expected.push(out.clone());
            }
            prop_assert_eq!(args, expected);
        }
    }

    #[test]
    fn test_command_without_output() {
        let job = make_job(
            "/videos/in.avi",
            None,
            vec!["--videoquality".into(), "5.0".into()],
        );
        let cmd = build_encoder_command(&EncoderTool::new("ffmpeg2theora"), &job);
        assert_eq!(
            get_command_args(&cmd),
            vec!["--frontend", "--videoquality", "5.0", "/videos/in.avi"]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start_is_noop() {
        let handle = RunHandle::new();
        handle.cancel(Duration::from_millis(100)).await;
        handle.cancel(Duration::from_millis(100)).await;

        assert!(handle.is_cancelled());
        assert_eq!(handle.state(), RunState::NotStarted);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let tool = EncoderTool::new("/nonexistent/dir/ffmpeg2theora");
        let job = make_job("in.avi", None, Vec::new());
        let handle = RunHandle::new();

        let err = EncodeProcess::start(&tool, &job, &handle).unwrap_err();
        assert!(matches!(err, EncodeError::Spawn { .. }));
        assert_eq!(handle.state(), RunState::SpawnFailed);

        // Nothing to signal
        handle.cancel(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), RunState::SpawnFailed);
    }

    #[cfg(unix)]
    mod with_fake_encoder {
        use super::*;
        use crate::test_support::fake_encoder;
        use std::time::Instant;

        async fn run_to_end(input: &str) -> (EncodeResult, Vec<String>, RunHandle) {
            let tool = fake_encoder();
            let job = make_job(input, Some("out.ogv"), Vec::new());
            let handle = RunHandle::new();
            let process = EncodeProcess::start(&tool, &job, &handle).expect("spawn fake encoder");

            let mut statuses = Vec::new();
            let result = process
                .run(ProgressParser::default(), |s| statuses.push(s))
                .await;
            (result, statuses, handle)
        }

        #[tokio::test]
        async fn test_successful_run() {
            let (result, statuses, handle) = run_to_end("quick.avi").await;

            assert!(result.success);
            assert_eq!(result.final_status, STATUS_DONE);
            assert_eq!(
                statuses,
                vec![
                    "encoding  25 % done",
                    "encoding  50 % done",
                    "encoding 100 % done"
                ]
            );
            assert_eq!(handle.state(), RunState::Completed);
        }

        #[tokio::test]
        async fn test_warning_is_reported() {
            let (result, statuses, _) = run_to_end("warn.avi").await;
            assert!(result.success);
            // The progress line right after the warning falls in the debounce window
            assert_eq!(statuses, vec!["clock skew"]);
        }

        #[tokio::test]
        async fn test_failed_result_detail() {
            let (result, _, _) = run_to_end("fail.avi").await;
            assert!(!result.success);
            assert_eq!(result.final_status, "Unable to decode input");
            assert_eq!(result.exit_status.and_then(|s| s.code()), Some(1));
        }

        #[tokio::test]
        async fn test_error_record_detail() {
            let (result, _, _) = run_to_end("badfile.avi").await;
            assert!(!result.success);
            assert_eq!(result.final_status, "Unable to open output file.");
        }

        #[tokio::test]
        async fn test_missing_result_is_failure() {
            let (result, statuses, _) = run_to_end("noresult.avi").await;
            assert!(!result.success);
            assert_eq!(result.final_status, STATUS_FAILED);
            assert_eq!(statuses, vec!["encoding  16 % done"]);
        }

        #[tokio::test]
        async fn test_exit_does_not_wait_for_inherited_stdout() {
            let started = Instant::now();
            let (result, statuses, handle) = run_to_end("orphan.avi").await;

            assert!(result.success);
            assert_eq!(statuses, vec!["encoding 100 % done"]);
            assert_eq!(handle.state(), RunState::Completed);
            // The background child keeps the pipe open for 5 seconds
            assert!(
                started.elapsed() < Duration::from_secs(3),
                "took {:?}",
                started.elapsed()
            );
        }

        async fn cancel_while_running(
            input: &str,
            grace: Duration,
        ) -> (EncodeResult, Duration, RunHandle) {
            let tool = fake_encoder();
            let job = make_job(input, None, Vec::new());
            let handle = RunHandle::new();
            let process = EncodeProcess::start(&tool, &job, &handle).expect("spawn fake encoder");
            let run = tokio::spawn(process.run(ProgressParser::default(), |_| {}));

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(handle.state(), RunState::Running);

            let started = Instant::now();
            handle.cancel(grace).await;
            let elapsed = started.elapsed();

            let result = run.await.expect("run task");
            (result, elapsed, handle)
        }

        #[tokio::test]
        async fn test_cancel_terminates_gracefully() {
            let (result, elapsed, handle) =
                cancel_while_running("slow.avi", Duration::from_millis(2500)).await;

            assert!(!result.success);
            assert!(elapsed < Duration::from_millis(2000), "took {:?}", elapsed);
            assert_eq!(handle.state(), RunState::Cancelled);

            // Cancelling a finished run does nothing
            handle.cancel(Duration::from_millis(2500)).await;
            assert_eq!(handle.state(), RunState::Cancelled);
        }

        #[tokio::test]
        async fn test_cancel_kills_after_grace_period() {
            let grace = Duration::from_millis(300);
            let (result, elapsed, handle) = cancel_while_running("stubborn.avi", grace).await;

            assert!(!result.success);
            assert!(elapsed >= grace, "killed too early: {:?}", elapsed);
            assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
            assert_eq!(handle.state(), RunState::Cancelled);
        }

        #[tokio::test]
        async fn test_cancel_requested_before_start_kills_on_start() {
            let tool = fake_encoder();
            let job = make_job("slow.avi", None, Vec::new());
            let handle = RunHandle::new();
            handle.cancel(Duration::from_millis(100)).await;

            let process = EncodeProcess::start(&tool, &job, &handle).expect("spawn fake encoder");
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                process.run(ProgressParser::default(), |_| {}),
            )
            .await
            .expect("killed encoder should exit promptly");

            assert!(!result.success);
            assert_eq!(handle.state(), RunState::Cancelled);
        }
    }
}
