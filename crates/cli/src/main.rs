//! CLI entry point for theora-queue
//!
//! Queues the given inputs, encodes them one after another with
//! `ffmpeg2theora` and prints every status change as `<label>: <status>`.

use clap::Parser;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use theora_queue::{
    Config, EncodeSettings, JobId, JobState, QueueSupervisor, StatusObserver, SubtitleTrack,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Simple Theora Encoder - queue videos for ffmpeg2theora
#[derive(Parser, Debug)]
#[command(name = "theora-queue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (used only if it exists)
    #[arg(short, long, default_value = "theora-queue.toml")]
    config: PathBuf,

    /// Path to the ffmpeg2theora executable
    #[arg(long)]
    encoder: Option<PathBuf>,

    /// Output file (only with a single input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the encoder's optional capabilities and exit
    #[arg(long)]
    probe: bool,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Video quality, 0 to 10
    #[arg(long)]
    videoquality: Option<f64>,

    /// Audio quality, -2 to 10
    #[arg(long)]
    audioquality: Option<f64>,

    /// Video bitrate in kbps
    #[arg(long)]
    videobitrate: Option<u32>,

    /// Audio bitrate in kbps
    #[arg(long)]
    audiobitrate: Option<u32>,

    /// Output framerate, e.g. 25 or 30000:1001
    #[arg(long)]
    framerate: Option<String>,

    #[arg(long)]
    samplerate: Option<u32>,

    #[arg(long)]
    channels: Option<u32>,

    #[arg(long)]
    crop_top: Option<u32>,

    #[arg(long)]
    crop_left: Option<u32>,

    #[arg(long)]
    crop_bottom: Option<u32>,

    #[arg(long)]
    crop_right: Option<u32>,

    /// Subtitle track as FILE[,LANGUAGE[,CATEGORY[,ENCODING]]] (repeatable)
    #[arg(long = "subtitles", value_parser = parse_subtitle_track)]
    subtitles: Vec<SubtitleTrack>,

    /// Videos to encode
    inputs: Vec<PathBuf>,
}

impl Args {
    fn settings(&self) -> EncodeSettings {
        EncodeSettings {
            width: self.width,
            height: self.height,
            video_quality: self.videoquality,
            audio_quality: self.audioquality,
            video_bitrate: self.videobitrate,
            audio_bitrate: self.audiobitrate,
            framerate: self.framerate.clone(),
            samplerate: self.samplerate,
            channels: self.channels,
            crop_top: self.crop_top,
            crop_left: self.crop_left,
            crop_bottom: self.crop_bottom,
            crop_right: self.crop_right,
            subtitles: self.subtitles.clone(),
        }
    }
}

fn parse_subtitle_track(value: &str) -> Result<SubtitleTrack, String> {
    let mut parts = value.split(',').map(str::trim);
    let file = match parts.next() {
        Some(file) if !file.is_empty() => file,
        _ => return Err("subtitle file name is empty".to_string()),
    };

    let mut track = SubtitleTrack::new(file);
    if let Some(language) = parts.next().filter(|s| !s.is_empty()) {
        track.language = language.to_string();
    }
    if let Some(category) = parts.next().filter(|s| !s.is_empty()) {
        track.category = category.to_string();
    }
    if let Some(encoding) = parts.next().filter(|s| !s.is_empty()) {
        track.encoding = encoding.to_string();
    }
    if parts.next().is_some() {
        return Err(format!("too many fields in '{}'", value));
    }
    Ok(track)
}

/// Prints status changes for jobs it knows a label for
#[derive(Default)]
struct PrintingObserver {
    labels: Mutex<HashMap<JobId, String>>,
}

impl PrintingObserver {
    fn register(&self, id: JobId, label: String) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.insert(id, label);
        }
    }
}

impl StatusObserver for PrintingObserver {
    fn on_status_changed(&self, id: JobId, status: &str) {
        let label = match self.labels.lock() {
            Ok(labels) => labels.get(&id).cloned(),
            Err(_) => None,
        };
        if let Some(label) = label {
            println!("{}: {}", label, status);
        }
    }
}

/// Blocking y/N prompt on stdin
fn confirm_quit() -> bool {
    print!("Videos are still being encoded. Really quit? [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(encoder) = &args.encoder {
        config.encoder.path = Some(encoder.clone());
    }

    let observer = Arc::new(PrintingObserver::default());
    let supervisor = match QueueSupervisor::initialize(&config, observer.clone()).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.probe {
        let caps = supervisor.capabilities();
        println!("encoder: {}", supervisor.tool().program().display());
        println!("subtitles: {}", caps.supports_subtitles);
        println!("iconv: {}", caps.supports_encoding_conversion);
        return ExitCode::SUCCESS;
    }

    if args.inputs.is_empty() {
        eprintln!("No input files given");
        return ExitCode::FAILURE;
    }
    if args.output.is_some() && args.inputs.len() > 1 {
        eprintln!("--output can only be used with a single input");
        return ExitCode::FAILURE;
    }

    let settings = args.settings();
    for input in &args.inputs {
        match supervisor
            .add_video(input.clone(), args.output.clone(), &settings)
            .await
        {
            Ok(id) => {
                if let Some(job) = supervisor.job(id) {
                    println!("{}: {}", job.label, job.status);
                    observer.register(id, job.label);
                }
            }
            Err(e) => error!("Skipping {}: {}", input.display(), e),
        }
    }

    if supervisor.jobs().is_empty() {
        eprintln!("Nothing to encode");
        return ExitCode::FAILURE;
    }

    supervisor.start_encoding();

    let mut interrupted = false;
    let finished = supervisor.wait_until_idle();
    tokio::pin!(finished);
    loop {
        tokio::select! {
            _ = &mut finished => break,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    (&mut finished).await;
                    break;
                }

                let encoding = supervisor
                    .jobs()
                    .iter()
                    .any(|job| job.state == JobState::Encoding);
                let answer = if encoding {
                    tokio::task::spawn_blocking(confirm_quit)
                        .await
                        .unwrap_or(false)
                } else {
                    true
                };

                if supervisor.request_close(|| answer).await {
                    interrupted = true;
                    break;
                }
            }
        }
    }

    let failed = supervisor
        .jobs()
        .iter()
        .filter(|job| job.state == JobState::Failed)
        .count();

    if failed > 0 {
        eprintln!("{} video(s) failed to encode", failed);
        ExitCode::FAILURE
    } else if interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}
