use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Running totals of what the acquisition loop has pulled off the board, with
/// both all-time counters and a sliding-window byte rate.
#[derive(Debug)]
pub struct CaptureStats {
    pub captures: usize,
    pub blocks: usize,
    pub bytes: usize,
    pub t_begin: Instant,
    window: Duration,
    recent: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl CaptureStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            captures: 0,
            blocks: 0,
            bytes: 0,
            t_begin: Instant::now(),
            window,
            recent: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    pub fn record(&mut self, blocks: usize, bytes: usize) {
        self.record_at(Instant::now(), blocks, bytes);
    }

    fn record_at(&mut self, now: Instant, blocks: usize, bytes: usize) {
        self.captures += 1;
        self.blocks += blocks;
        self.bytes += bytes;

        self.recent.push_back((now, bytes));
        self.bytes_in_window += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, size)) = self.recent.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.recent.pop_front();
            self.bytes_in_window -= size;
        }
    }

    /// Average rate since the stats were created or reset, in MB/s.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.bytes as f64 / secs / (1024.0 * 1024.0)
    }

    /// Rate over the sliding window, in MB/s.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.bytes_in_window as f64 / secs / (1024.0 * 1024.0)
    }

    pub fn reset(&mut self) {
        *self = Self::with_window(self.window);
    }
}
