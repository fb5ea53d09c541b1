//! Job descriptors and the encoder options derived from user settings.
//!
//! A [`JobDescriptor`] is built once when a video is queued and never changes
//! afterwards; lifecycle state lives in the supervisor.

use crate::probe::Capabilities;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default maximum length of a display label before truncation.
pub const DEFAULT_LABEL_MAX_CHARS: usize = 25;

/// Identity of a queued job.
///
/// Assigned monotonically by the supervisor and never reused, so it stays
/// valid for observers after other jobs are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Job is waiting in queue.
    Waiting,
    /// Job is currently encoding.
    Encoding,
    /// Encoder reported success.
    Done,
    /// Encoder failed to start or reported an error.
    Failed,
    /// Encoding was cancelled by the user.
    Cancelled,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Waiting
    }
}

impl JobState {
    /// Done, failed and cancelled jobs are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Encoding => write!(f, "encoding"),
            JobState::Done => write!(f, "done"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything needed to run the encoder for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub id: JobId,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    /// Truncated form of `input_path` for list views.
    pub display_label: String,
    /// Encoder arguments placed between `--frontend` and the input path.
    pub options: Vec<String>,
}

impl JobDescriptor {
    pub fn new(
        id: JobId,
        input_path: PathBuf,
        output_path: Option<PathBuf>,
        options: Vec<String>,
        label_max_chars: usize,
    ) -> Self {
        let display_label = display_label(&input_path, label_max_chars);
        Self {
            id,
            input_path,
            output_path,
            display_label,
            options,
        }
    }

    /// File name of the input, for log lines.
    pub fn name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.to_string_lossy().into_owned())
    }
}

/// Shorten a path for display.
///
/// Paths longer than `max_chars` characters become `"..."` followed by their
/// last `max_chars - 1` characters.
pub fn display_label(path: &Path, max_chars: usize) -> String {
    let text = path.to_string_lossy();
    let len = text.chars().count();
    if len <= max_chars {
        return text.into_owned();
    }
    let keep = max_chars.saturating_sub(1);
    let tail: String = text.chars().skip(len - keep).collect();
    format!("...{}", tail)
}

/// Errors for settings the encoder cannot honour.
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("encoder was built without subtitle support")]
    SubtitlesUnsupported,

    #[error("subtitle encoding {0} needs iconv support in the encoder")]
    EncodingUnsupported(String),

    #[error("subtitle track {0} has no file")]
    MissingSubtitleFile(usize),
}

/// One subtitle file muxed into the output as a Kate stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleTrack {
    pub file: PathBuf,
    pub language: String,
    pub category: String,
    pub encoding: String,
}

impl SubtitleTrack {
    /// A track with the default language, category and encoding.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            language: "en".to_string(),
            category: "SUB".to_string(),
            encoding: "UTF-8".to_string(),
        }
    }

    /// Encodings the encoder converts without iconv.
    fn is_builtin_encoding(&self) -> bool {
        ["utf-8", "utf8", "iso-8859-1", "latin1"]
            .iter()
            .any(|e| self.encoding.eq_ignore_ascii_case(e))
    }
}

/// User-chosen encode settings. Absent or zero fields emit nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_quality: Option<f64>,
    pub audio_quality: Option<f64>,
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
    pub framerate: Option<String>,
    pub samplerate: Option<u32>,
    pub channels: Option<u32>,
    pub crop_top: Option<u32>,
    pub crop_left: Option<u32>,
    pub crop_bottom: Option<u32>,
    pub crop_right: Option<u32>,
    pub subtitles: Vec<SubtitleTrack>,
}

impl EncodeSettings {
    /// Check the settings against what the encoder was built with.
    pub fn validate(&self, caps: &Capabilities) -> Result<(), SettingsError> {
        if self.subtitles.is_empty() {
            return Ok(());
        }
        if !caps.supports_subtitles {
            return Err(SettingsError::SubtitlesUnsupported);
        }
        for (idx, track) in self.subtitles.iter().enumerate() {
            if track.file.as_os_str().is_empty() {
                return Err(SettingsError::MissingSubtitleFile(idx));
            }
            if !caps.supports_encoding_conversion && !track.is_builtin_encoding() {
                return Err(SettingsError::EncodingUnsupported(track.encoding.clone()));
            }
        }
        Ok(())
    }

    /// Encoder command-line options, in the order the encoder documents them.
    pub fn to_options(&self) -> Vec<String> {
        let mut opts = Vec::new();

        push_int(&mut opts, "--width", self.width);
        push_int(&mut opts, "--height", self.height);
        push_float(&mut opts, "--videoquality", self.video_quality);
        push_float(&mut opts, "--audioquality", self.audio_quality);
        push_int(&mut opts, "--videobitrate", self.video_bitrate);
        push_int(&mut opts, "--audiobitrate", self.audio_bitrate);
        if let Some(rate) = self.framerate.as_deref().map(str::trim) {
            if !rate.is_empty() {
                opts.push("--framerate".to_string());
                opts.push(rate.to_string());
            }
        }
        push_int(&mut opts, "--samplerate", self.samplerate);
        push_int(&mut opts, "--channels", self.channels);
        push_int(&mut opts, "--croptop", self.crop_top);
        push_int(&mut opts, "--cropleft", self.crop_left);
        push_int(&mut opts, "--cropbottom", self.crop_bottom);
        push_int(&mut opts, "--cropright", self.crop_right);

        for track in &self.subtitles {
            opts.push("--subtitles".to_string());
            opts.push(track.file.to_string_lossy().into_owned());
            opts.push("--subtitles-language".to_string());
            opts.push(track.language.clone());
            opts.push("--subtitles-category".to_string());
            opts.push(track.category.clone());
            opts.push("--subtitles-encoding".to_string());
            opts.push(track.encoding.clone());
        }

        opts
    }
}

fn push_int(opts: &mut Vec<String>, flag: &str, value: Option<u32>) {
    if let Some(v) = value.filter(|v| *v != 0) {
        opts.push(flag.to_string());
        opts.push(v.to_string());
    }
}

fn push_float(opts: &mut Vec<String>, flag: &str, value: Option<f64>) {
    if let Some(v) = value.filter(|v| *v != 0.0) {
        opts.push(flag.to_string());
        opts.push(format_float(v));
    }
}

/// Render a float the way the encoder's option parser expects: always with a
/// fractional part.
fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.is_finite() {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}
