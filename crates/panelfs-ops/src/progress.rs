//! Progress accounting and transfer-rate estimation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use humansize::{format_size, DECIMAL};

/// Number of samples kept by a [`ThroughputWindow`] by default.
pub const DEFAULT_WINDOW_SAMPLES: usize = 10;

/// Byte and entry counters for a running task.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    /// Number of files completed.
    pub files_completed: usize,
    /// Total number of files to process.
    pub files_total: usize,
    /// Number of bytes processed so far.
    pub bytes_processed: u64,
    /// Total bytes to process (0 when the input is empty).
    pub bytes_total: u64,
    last_reported: Option<u8>,
}

impl ProgressTracker {
    pub fn new(files_total: usize, bytes_total: u64) -> Self {
        Self {
            files_completed: 0,
            files_total,
            bytes_processed: 0,
            bytes_total,
            last_reported: None,
        }
    }

    /// Whole-number percentage, rounded down.
    ///
    /// Byte-based when the total is known, otherwise by file count.
    pub fn percentage(&self) -> u8 {
        let ratio = if self.bytes_total > 0 {
            self.bytes_processed as f64 / self.bytes_total as f64
        } else if self.files_total > 0 {
            self.files_completed as f64 / self.files_total as f64
        } else {
            0.0
        };
        (ratio * 100.0).floor().clamp(0.0, 100.0) as u8
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_processed = self.bytes_processed.saturating_add(bytes);
    }

    /// Increment the completed count.
    pub fn complete_file(&mut self) {
        self.files_completed += 1;
    }

    /// Percentage to publish, or `None` if it has not moved since the last
    /// call.
    pub fn take_report(&mut self) -> Option<u8> {
        let pct = self.percentage();
        if self.last_reported == Some(pct) {
            return None;
        }
        self.last_reported = Some(pct);
        Some(pct)
    }
}

/// Sliding window of `(timestamp, bytes transferred)` samples.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
    capacity: usize,
    started: Instant,
}

impl ThroughputWindow {
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, Instant::now())
    }

    /// Create a window whose transfer started at `started`.
    pub fn starting_at(capacity: usize, started: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
            started,
        }
    }

    /// Record the cumulative byte count now.
    pub fn record(&mut self, transferred: u64) {
        self.record_at(Instant::now(), transferred);
    }

    /// Record the cumulative byte count at `at`.
    pub fn record_at(&mut self, at: Instant, transferred: u64) {
        self.samples.push_back((at, transferred));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the window.
    ///
    /// With a single sample, the average rate since the transfer started.
    pub fn speed(&self) -> f64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };

        let (from, from_bytes) = if self.samples.len() < 2 {
            (self.started, 0)
        } else {
            *first
        };
        let elapsed = last.0.saturating_duration_since(from).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last.1.saturating_sub(from_bytes) as f64 / elapsed
    }

    /// Estimated time until `total` bytes are transferred; `None` while the
    /// speed is zero.
    pub fn eta(&self, total: u64) -> Option<Duration> {
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        let transferred = self.samples.back().map_or(0, |(_, bytes)| *bytes);
        let remaining = total.saturating_sub(transferred) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SAMPLES)
    }
}

/// Format a rate such as `"12.4 MB/s"`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64, DECIMAL))
}

/// Format a remaining duration such as `"1h 02m"` or `"45s"`.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}
