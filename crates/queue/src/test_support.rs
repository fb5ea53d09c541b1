//! Scripted stand-in for `ffmpeg2theora` used by the unit tests
//!
//! The script answers `--help` and `--info` like the real encoder and, in
//! `--frontend` mode, behaves according to the input file name:
//!
//! | name contains | behaviour |
//! |---|---|
//! | `quick` | three progress lines, then `{"result": "ok"}` |
//! | `warn` | a WARNING, one progress line, then ok |
//! | `fail` | one progress line, then a non-ok result |
//! | `badfile` | a `code`/`error` record and no result |
//! | `noresult` | progress and garbage, exits without a result |
//! | `slow` | progress every 50ms for ~30s, dies on SIGTERM |
//! | `orphan` | leaves a child holding stdout open, then succeeds |
//! | `stubborn` | like `slow` but ignores SIGTERM |
//!
//! `--info` on a name containing `broken` prints something that is not JSON.

use crate::probe::EncoderTool;
use std::os::unix::fs::PermissionsExt;
use std::sync::OnceLock;
use tempfile::TempDir;

const SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  --help)
    echo "Usage: ffmpeg2theora [options] input"
    echo "Subtitles options:"
    echo "  --subtitles-encoding  supported are all encodings supported by iconv"
    exit 0 ;;
  --info)
    case "$2" in
      *broken*) echo "not json" ;;
      *) echo '{"duration": 60.0, "video": [{"codec": "h264"}], "audio": [{"codec": "aac"}]}' ;;
    esac
    exit 0 ;;
esac

input=""
for arg in "$@"; do
  case "$arg" in
    *.avi) input="$arg" ;;
  esac
done

progress() {
  echo "{\"duration\": 60.0, \"position\": $1, \"remaining\": $2}"
}

crawl() {
  i=0
  while [ $i -lt 600 ]; do
    progress 1 59
    sleep 0.05
    i=$((i+1))
  done
  echo '{"result": "ok"}'
}

case "$input" in
  *quick*)
    progress 15 45
    progress 30 30
    progress 60 0
    echo '{"result": "ok"}' ;;
  *warn*)
    echo '{"WARNING": "clock skew"}'
    progress 30 30
    echo '{"result": "ok"}' ;;
  *fail*)
    progress 5 55
    echo '{"result": "Unable to decode input"}'
    exit 1 ;;
  *badfile*)
    echo '{"code": "badfile", "error": "Unable to open output file."}'
    exit 1 ;;
  *noresult*)
    progress 10 50
    echo 'garbage line'
    exit 0 ;;
  *orphan*)
    sleep 5 &
    progress 60 0
    echo '{"result": "ok"}'
    exit 0 ;;
  *stubborn*)
    trap '' TERM
    crawl ;;
  *slow*)
    crawl ;;
  *)
    echo '{"result": "ok"}' ;;
esac
"#;

static FAKE_ENCODER: OnceLock<TempDir> = OnceLock::new();

/// Path to the fake encoder, written once per test binary
pub fn fake_encoder() -> EncoderTool {
    let dir = FAKE_ENCODER.get_or_init(|| {
        let dir = TempDir::new().expect("create temp dir for fake encoder");
        let path = dir.path().join("ffmpeg2theora");
        std::fs::write(&path, SCRIPT).expect("write fake encoder");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("make fake encoder executable");
        dir
    });
    EncoderTool::new(dir.path().join("ffmpeg2theora"))
}
