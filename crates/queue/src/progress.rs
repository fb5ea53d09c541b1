//! Parser for the encoder's `--frontend` status stream.
//!
//! Every line the encoder prints is a small JSON object such as
//! `{"duration": 60.0, "position": 12.5, "remaining": 47.5}`. Records are
//! merged into a [`ProgressSnapshot`], which is turned into a human-readable
//! status. Lines that are not JSON objects are dropped.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::{Duration, Instant};

/// How long a warning stays visible before progress updates resume.
pub const WARNING_DEBOUNCE: Duration = Duration::from_secs(3);

/// Status shown while no usable position/duration pair is known.
pub const STATUS_ENCODING: &str = "encoding..";

/// One line of encoder output. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressRecord {
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub position: Option<f64>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub remaining: Option<f64>,
    #[serde(default, rename = "WARNING", deserialize_with = "lenient_text")]
    pub warning: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub result: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub error: Option<String>,
}

impl ProgressRecord {
    /// Parse one line; anything but a JSON object yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Seconds arrive as JSON numbers, or as numeric strings from older builds.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Accumulated state of one encoder run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub position: Option<f64>,
    pub duration: Option<f64>,
    pub remaining: Option<f64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl ProgressSnapshot {
    /// Overwrite every field present in `record`. Warnings are not kept.
    pub fn merge(&mut self, record: &ProgressRecord) {
        if record.position.is_some() {
            self.position = record.position;
        }
        if record.duration.is_some() {
            self.duration = record.duration;
        }
        if record.remaining.is_some() {
            self.remaining = record.remaining;
        }
        if record.result.is_some() {
            self.result = record.result.clone();
        }
        if record.error.is_some() {
            self.error = record.error.clone();
        }
    }

    /// Percentage done, when both position and a non-zero duration are known.
    pub fn percent_done(&self) -> Option<f64> {
        match (self.position, self.duration) {
            (Some(pos), Some(dur)) if dur != 0.0 => Some(pos / dur * 100.0),
            _ => None,
        }
    }

    /// The routine status line for the current snapshot.
    pub fn status(&self) -> String {
        match self.percent_done() {
            Some(pct) => format!("encoding {:>3} % done", pct.trunc() as i64),
            None => STATUS_ENCODING.to_string(),
        }
    }

    /// Whether the encoder reported a successful result.
    pub fn succeeded(&self) -> bool {
        self.result.as_deref() == Some("ok")
    }

    /// What went wrong, if the encoder said so.
    pub fn failure_detail(&self) -> Option<&str> {
        match self.result.as_deref() {
            Some("ok") => None,
            Some(detail) => Some(detail),
            None => self.error.as_deref(),
        }
    }
}

/// Turns encoder output lines into status updates.
///
/// A warning is shown immediately and then holds the display for the debounce
/// window; a status identical to the last one returned is never repeated.
#[derive(Debug)]
pub struct ProgressParser {
    snapshot: ProgressSnapshot,
    debounce: Duration,
    warning_until: Option<Instant>,
    last_status: Option<String>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new(WARNING_DEBOUNCE)
    }
}

impl ProgressParser {
    pub fn new(debounce: Duration) -> Self {
        Self {
            snapshot: ProgressSnapshot::default(),
            debounce,
            warning_until: None,
            last_status: None,
        }
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> ProgressSnapshot {
        self.snapshot
    }

    /// Feed one line at the current wall-clock time.
    pub fn parse_line(&mut self, line: &str) -> Option<String> {
        self.parse_line_at(line, Instant::now())
    }

    /// Feed one line as if it arrived at `now`.
    pub fn parse_line_at(&mut self, line: &str, now: Instant) -> Option<String> {
        let record = ProgressRecord::parse(line)?;
        self.snapshot.merge(&record);

        let status = match record.warning {
            Some(warning) => {
                self.warning_until = Some(now + self.debounce);
                warning
            }
            None => {
                if self.warning_until.map_or(false, |until| now < until) {
                    return None;
                }
                self.snapshot.status()
            }
        };

        if self.last_status.as_deref() == Some(status.as_str()) {
            return None;
        }
        self.last_status = Some(status.clone());
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_percent_status_format(pos in 0u32..10_000, dur in 1u32..10_000) {
            let mut parser = ProgressParser::default();
            let line = format!("{{\"position\": {}, \"duration\": {}}}", pos, dur);
            let status = parser.parse_line_at(&line, Instant::now()).expect("first status");

            let pct = (pos as f64 / dur as f64 * 100.0).trunc() as i64;
            prop_assert_eq!(status, format!("encoding {:>3} % done", pct));
        }

        #[test]
        fn prop_garbage_lines_are_ignored(line in "[^{]{0,60}") {
            let mut parser = ProgressParser::default();
            prop_assert_eq!(parser.parse_line_at(&line, Instant::now()), None);
            prop_assert_eq!(parser.snapshot(), &ProgressSnapshot::default());
        }
    }

    #[test]
    fn test_half_done() {
        let mut parser = ProgressParser::default();
        let line = r#"{"position": "30", "duration": "60"}"#;
        let status = parser.parse_line_at(line, Instant::now());
        assert_eq!(status.as_deref(), Some("encoding  50 % done"));
    }

    #[test]
    fn test_numeric_fields_from_encoder() {
        let mut parser = ProgressParser::default();
        let status = parser.parse_line_at(
            concat!(
                r#"{"duration": 120.000000, "position": 6.00, "audio_kbps":  96, "#,
                r#""video_kbps": 700, "remaining": 114.00}"#
            ),
            Instant::now(),
        );
        assert_eq!(status.as_deref(), Some("encoding   5 % done"));
        assert_eq!(parser.snapshot().remaining, Some(114.0));
    }

    #[test]
    fn test_warning_debounce() {
        let start = Instant::now();
        let mut parser = ProgressParser::default();

        let status = parser.parse_line_at(r#"{"WARNING": "clock skew"}"#, start);
        assert_eq!(status.as_deref(), Some("clock skew"));

        // Progress inside the window is merged but not shown
        for (millis, position) in [(500, 5), (1000, 10), (2000, 20), (2900, 29)] {
            let line = format!(r#"{{"position": {}, "duration": 60}}"#, position);
            let now = start + Duration::from_millis(millis);
            assert_eq!(parser.parse_line_at(&line, now), None);
        }
        assert_eq!(parser.snapshot().position, Some(29.0));

        let after = start + Duration::from_secs(3);
        let status = parser.parse_line_at(r#"{"position": 30, "duration": 60}"#, after);
        assert_eq!(status.as_deref(), Some("encoding  50 % done"));
    }

    #[test]
    fn test_warning_is_not_kept_in_snapshot() {
        let start = Instant::now();
        let mut parser = ProgressParser::new(Duration::from_millis(0));
        parser.parse_line_at(r#"{"WARNING": "unknown subtitle encoding"}"#, start);

        // No position yet, so the generic indicator follows the warning
        let status = parser.parse_line_at(r#"{"remaining": 10}"#, start);
        assert_eq!(status.as_deref(), Some(STATUS_ENCODING));
    }

    #[test]
    fn test_unchanged_status_is_suppressed() {
        let now = Instant::now();
        let mut parser = ProgressParser::default();

        assert!(parser
            .parse_line_at(r#"{"position": 1.0, "duration": 100}"#, now)
            .is_some());
        assert_eq!(
            parser.parse_line_at(r#"{"position": 1.5, "duration": 100}"#, now),
            None
        );
        assert_eq!(
            parser
                .parse_line_at(r#"{"position": 2.0, "duration": 100}"#, now)
                .as_deref(),
            Some("encoding   2 % done")
        );
    }

    #[test]
    fn test_position_without_duration() {
        let now = Instant::now();
        let mut parser = ProgressParser::default();
        assert_eq!(
            parser
                .parse_line_at(r#"{"position": 12, "duration": 0}"#, now)
                .as_deref(),
            Some(STATUS_ENCODING)
        );

        let mut parser = ProgressParser::default();
        assert_eq!(
            parser.parse_line_at(r#"{"position": 12}"#, now).as_deref(),
            Some(STATUS_ENCODING)
        );
    }

    #[test]
    fn test_malformed_lines_are_ignored() {
        let now = Instant::now();
        let mut parser = ProgressParser::default();
        assert_eq!(parser.parse_line_at("", now), None);
        assert_eq!(parser.parse_line_at("{\"position\": 3", now), None);
        assert_eq!(parser.parse_line_at("[1, 2]", now), None);
        assert_eq!(parser.parse_line_at("Input #0, avi", now), None);
    }

    #[test]
    fn test_lenient_numbers() {
        let record = ProgressRecord::parse(r#"{"position": "n/a", "duration": 10}"#).unwrap();
        assert_eq!(record.position, None);
        assert_eq!(record.duration, Some(10.0));
    }

    #[test]
    fn test_result_and_failure_detail() {
        let now = Instant::now();
        let mut parser = ProgressParser::default();
        parser.parse_line_at(r#"{"position": 10, "duration": 10}"#, now);
        parser.parse_line_at(r#"{"result": "ok"}"#, now);
        assert!(parser.snapshot().succeeded());
        assert_eq!(parser.snapshot().failure_detail(), None);

        let mut parser = ProgressParser::default();
        parser.parse_line_at(r#"{"result": "Unable to decode input"}"#, now);
        assert!(!parser.snapshot().succeeded());
        assert_eq!(
            parser.snapshot().failure_detail(),
            Some("Unable to decode input")
        );

        let mut parser = ProgressParser::default();
        parser.parse_line_at(
            r#"{"code": "badfile", "error":"Unable to open output file."}"#,
            now,
        );
        let snapshot = parser.into_snapshot();
        assert!(!snapshot.succeeded());
        assert_eq!(snapshot.failure_detail(), Some("Unable to open output file."));
        assert_eq!(ProgressSnapshot::default().failure_detail(), None);
    }
}
