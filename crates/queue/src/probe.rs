//! Encoder discovery and capability probing
//!
//! Locates the `ffmpeg2theora` executable and asks it what it can do before
//! any job is accepted:
//! - `--help` output reveals subtitle and iconv support
//! - `--info <file>` returns a JSON description of an input file

use crate::config::EncoderConfig;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Base name of the encoder executable
pub const ENCODER_NAME: &str = "ffmpeg2theora";

/// Marker in `--help` output when subtitle (Kate) support is compiled in
const SUBTITLES_MARKER: &str = "Subtitles options:";

/// Marker in `--help` output when subtitle encodings are converted through iconv
const ICONV_MARKER: &str = "supported are all encodings supported by iconv";

/// Error types for probing the encoder
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Encoder not available at {path}: {source}")]
    ToolUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not read file info for {path}: {reason}")]
    FileInfo { path: PathBuf, reason: String },
}

/// The external encoder executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderTool {
    program: PathBuf,
}

impl EncoderTool {
    /// Use an explicit executable path
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Search the usual install locations for the encoder
    ///
    /// Candidates, in order: `<resource_dir>/<name>`, `<resource_dir>/../../<name>`
    /// (a frontend bundled inside the encoder's source tree) and `./<name>`.
    /// When none exists the bare name is returned and resolved through `PATH`.
    pub fn locate(resource_dir: Option<&Path>) -> Self {
        let name = executable_name();

        let mut candidates = Vec::new();
        if let Some(dir) = resource_dir {
            candidates.push(dir.join(&name));
            candidates.push(dir.join("../..").join(&name));
        }
        candidates.push(Path::new(".").join(&name));

        let program = candidates
            .into_iter()
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(&name));

        debug!("Using encoder at {}", program.display());
        Self { program }
    }

    /// Build the tool from configuration: an explicit path wins over searching
    pub fn from_config(cfg: &EncoderConfig) -> Self {
        match &cfg.path {
            Some(path) => Self::new(path),
            None => Self::locate(cfg.resource_dir.as_deref()),
        }
    }

    /// Path (or bare name) of the executable
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start a command for this tool with stdin closed
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn unavailable(&self, source: std::io::Error) -> ProbeError {
        ProbeError::ToolUnavailable {
            path: self.program.clone(),
            source,
        }
    }
}

fn executable_name() -> String {
    if cfg!(windows) {
        format!("{}.exe", ENCODER_NAME)
    } else {
        ENCODER_NAME.to_string()
    }
}

/// Optional features the encoder was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Kate subtitle streams can be muxed in
    pub supports_subtitles: bool,
    /// Subtitle files in any iconv encoding can be converted
    pub supports_encoding_conversion: bool,
}

impl Capabilities {
    /// Derive capabilities from the encoder's help text
    pub fn from_help_text(help: &str) -> Self {
        Self {
            supports_subtitles: help.contains(SUBTITLES_MARKER),
            supports_encoding_conversion: help.contains(ICONV_MARKER),
        }
    }
}

/// Run `<tool> --help` once and detect optional capabilities
///
/// Stdout and stderr are searched together. Fails with
/// [`ProbeError::ToolUnavailable`] if the executable cannot be started.
pub async fn probe(tool: &EncoderTool) -> Result<Capabilities, ProbeError> {
    let output = tool
        .command()
        .arg("--help")
        .output()
        .await
        .map_err(|e| tool.unavailable(e))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    let caps = Capabilities::from_help_text(&combined);
    info!(
        subtitles = caps.supports_subtitles,
        iconv = caps.supports_encoding_conversion,
        "Probed {}",
        tool.program().display()
    );
    Ok(caps)
}

/// Description of an input file as reported by `<tool> --info`
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    fields: Map<String, Value>,
}

impl FileInfo {
    /// Parse the tool's `--info` output; it must be a single JSON object
    pub fn parse(data: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(data.trim()) {
            Ok(Value::Object(fields)) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Raw value for a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Duration in seconds, if the tool reported one
    pub fn duration(&self) -> Option<f64> {
        match self.fields.get("duration")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether the source has at least one video stream
    pub fn has_video(&self) -> bool {
        has_streams(self.fields.get("video"))
    }

    /// Whether the source has at least one audio stream
    pub fn has_audio(&self) -> bool {
        has_streams(self.fields.get("audio"))
    }
}

fn has_streams(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Array(streams)) => !streams.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Ask the encoder to describe `path`
///
/// Output that is not a JSON object means the file cannot be encoded and is
/// reported as [`ProbeError::FileInfo`].
pub async fn file_info(tool: &EncoderTool, path: &Path) -> Result<FileInfo, ProbeError> {
    let output = tool
        .command()
        .arg("--info")
        .arg(path)
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| tool.unavailable(e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    FileInfo::parse(&stdout).ok_or_else(|| ProbeError::FileInfo {
        path: path.to_path_buf(),
        reason: describe_bad_output(&stdout),
    })
}

fn describe_bad_output(stdout: &str) -> String {
    match stdout.lines().next().map(str::trim) {
        None | Some("") => "encoder printed nothing".to_string(),
        Some(line) => format!("unexpected output: {}", line),
    }
}
