//! FFmpeg progress parsing and delta throttling.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Progress information from FFmpeg.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Current frame number
    pub frame: u64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Calculate progress percentage given total duration in milliseconds.
    pub fn percentage(&self, total_duration_ms: i64) -> f64 {
        if total_duration_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_duration_ms as f64) * 100.0).min(100.0)
    }
}

/// Callback receiving progress updates from a running command.
pub type ProgressSink = Box<dyn Fn(FfmpegProgress) + Send + Sync + 'static>;

/// A sink that drops every update.
pub fn discard() -> ProgressSink {
    Box::new(|_| {})
}

/// Parse one line of `-progress` output into `current`.
///
/// Returns a snapshot at the end of each progress block.
pub fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;

    match key {
        // FFmpeg reports microseconds under both names.
        "out_time_ms" | "out_time_us" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            return Some(current.clone());
        }
        _ => {}
    }

    None
}

/// Turns absolute encoded time into deltas, emitting at most one per interval.
#[derive(Debug)]
pub struct DeltaThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    reported_ms: i64,
}

impl DeltaThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            reported_ms: 0,
        }
    }

    /// Feed a progress snapshot. Returns the delta to report, if one is due.
    pub fn observe(&mut self, progress: &FfmpegProgress, now: Instant) -> Option<i64> {
        let due = progress.is_complete
            || self
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.interval);
        if !due {
            return None;
        }

        let delta = progress.out_time_ms - self.reported_ms;
        if delta <= 0 {
            return None;
        }
        self.reported_ms = progress.out_time_ms;
        self.last_emit = Some(now);
        Some(delta)
    }

    /// Remaining delta up to `total_ms`, for a final report after success.
    pub fn flush(&mut self, total_ms: i64) -> Option<i64> {
        let delta = total_ms - self.reported_ms;
        if delta <= 0 {
            return None;
        }
        self.reported_ms = total_ms;
        Some(delta)
    }

    pub fn reported_ms(&self) -> i64 {
        self.reported_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> FfmpegProgress {
        FfmpegProgress {
            out_time_ms: ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_parsing() {
        let mut progress = FfmpegProgress::default();

        assert!(parse_progress_line("out_time_ms=5000000", &mut progress).is_none());
        assert_eq!(progress.out_time_ms, 5000);

        parse_progress_line("speed=1.5x", &mut progress);
        assert!((progress.speed - 1.5).abs() < 0.01);

        parse_progress_line("speed=N/A", &mut progress);
        assert!((progress.speed - 1.5).abs() < 0.01);

        let result = parse_progress_line("progress=end", &mut progress);
        assert!(result.is_some());
        assert!(progress.is_complete);
        assert!(parse_progress_line("[h264] some warning", &mut progress).is_none());
    }

    #[test]
    fn test_progress_percentage() {
        assert!((at(5000).percentage(10000) - 50.0).abs() < 0.01);
        assert!((at(15000).percentage(10000) - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_throttle_emits_deltas_per_interval() {
        let start = Instant::now();
        let mut throttle = DeltaThrottle::new(Duration::from_secs(2));

        assert_eq!(throttle.observe(&at(1000), start), Some(1000));
        assert_eq!(throttle.observe(&at(1500), start + Duration::from_millis(500)), None);
        assert_eq!(throttle.observe(&at(4000), start + Duration::from_secs(2)), Some(3000));
        assert_eq!(throttle.reported_ms(), 4000);
    }

    #[test]
    fn test_completion_bypasses_interval_and_flush_tops_up() {
        let start = Instant::now();
        let mut throttle = DeltaThrottle::new(Duration::from_secs(2));
        throttle.observe(&at(1000), start);

        let mut end = at(9000);
        end.is_complete = true;
        assert_eq!(throttle.observe(&end, start + Duration::from_millis(10)), Some(8000));
        assert_eq!(throttle.flush(10_000), Some(1000));
        assert_eq!(throttle.flush(10_000), None);
    }
}
