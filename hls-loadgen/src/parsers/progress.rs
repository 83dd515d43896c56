//! Structured progress parser: one `KEY=VALUE` token per line, terminated
//! periodically by `progress=continue` or `progress=end`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Parser;
use crate::stats::{ClientStats, ProgressSample};

/// Parses FFmpeg's `-progress` key/value stream and publishes one
/// `ProgressSample` to `ClientStats` per terminator line.
pub struct ProgressParser {
    stats: Arc<ClientStats>,
    start: Instant,
    position: Duration,
    speed: f64,
    total_size: u64,
    last_total_size: u64,
}

impl ProgressParser {
    pub fn new(stats: Arc<ClientStats>) -> Self {
        Self {
            stats,
            start: Instant::now(),
            position: Duration::ZERO,
            speed: 0.0,
            total_size: 0,
            last_total_size: 0,
        }
    }

    fn publish_terminator(&mut self) {
        let elapsed = self.start.elapsed();
        let drift = elapsed.abs_diff(self.position);
        let bytes_delta = self.total_size.saturating_sub(self.last_total_size);
        self.last_total_size = self.total_size;

        self.stats.add_bytes(bytes_delta);
        self.stats.record_progress(ProgressSample {
            speed: self.speed,
            drift,
            bytes_delta,
        });
    }
}

impl Parser for ProgressParser {
    fn parse_line(&mut self, line: &str) {
        let Some((key, value)) = line.split_once('=') else {
            return;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.position = Duration::from_micros(us.max(0) as u64);
                }
            }
            "out_time" => {
                if let Some(d) = parse_hms(value) {
                    self.position = d;
                }
            }
            "speed" => {
                let trimmed = value.trim_end_matches('x');
                if let Ok(v) = trimmed.parse::<f64>() {
                    self.speed = v;
                }
            }
            "total_size" => {
                if let Ok(v) = value.parse::<u64>() {
                    self.total_size = v;
                }
            }
            "progress" => {
                // terminator: "continue" or "end" — unknown values are ignored.
                if value == "continue" || value == "end" {
                    self.publish_terminator();
                }
            }
            _ => {
                // Unknown keys (frame=, fps=, bitrate=, dup_frames=, ...) are
                // ignored, as the grammar requires.
            }
        }
    }
}

/// Parse `HH:MM:SS.mmm` into a `Duration`. Returns `None` on malformed input
/// rather than panicking; the caller simply keeps the previous position.
fn parse_hms(s: &str) -> Option<Duration> {
    let mut parts = s.splitn(3, ':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let sec_str = parts.next()?;
    let sec: f64 = sec_str.parse().ok()?;
    if sec < 0.0 {
        return None;
    }
    let total_secs = (h * 3600 + m * 60) as f64 + sec;
    Some(Duration::from_secs_f64(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_unknown_keys() {
        let stats = Arc::new(ClientStats::new());
        let mut parser = ProgressParser::new(stats.clone());
        parser.parse_line("frame=120");
        parser.parse_line("fps=30.0");
        parser.parse_line("bitrate=512.3kbits/s");
        assert!(stats.last_progress_at().is_none());
    }

    #[test]
    fn publishes_on_terminator() {
        let stats = Arc::new(ClientStats::new());
        let mut parser = ProgressParser::new(stats.clone());
        parser.parse_line("total_size=1000");
        parser.parse_line("speed=1.02x");
        parser.parse_line("out_time=00:00:01.000");
        parser.parse_line("progress=continue");

        assert!(stats.last_progress_at().is_some());
        assert!((stats.last_speed() - 1.02).abs() < 0.001);
        assert_eq!(stats.bytes_downloaded(), 1000);
    }

    #[test]
    fn bytes_delta_only_counts_new_bytes_between_terminators() {
        let stats = Arc::new(ClientStats::new());
        let mut parser = ProgressParser::new(stats.clone());
        parser.parse_line("total_size=1000");
        parser.parse_line("progress=continue");
        parser.parse_line("total_size=1500");
        parser.parse_line("progress=continue");
        assert_eq!(stats.bytes_downloaded(), 1500);
    }

    #[test]
    fn garbage_progress_value_is_ignored_not_published() {
        let stats = Arc::new(ClientStats::new());
        let mut parser = ProgressParser::new(stats.clone());
        parser.parse_line("progress=bogus");
        assert!(stats.last_progress_at().is_none());
    }

    #[test]
    fn malformed_line_without_equals_does_not_panic() {
        let stats = Arc::new(ClientStats::new());
        let mut parser = ProgressParser::new(stats);
        parser.parse_line("not a key value line");
    }

    #[test]
    fn hms_parsing() {
        assert_eq!(parse_hms("00:00:01.500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_hms("01:02:03.000"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_hms("garbage"), None);
    }
}
