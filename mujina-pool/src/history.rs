//! Hashrate history.
//!
//! Every share credited to the local hashrate is appended as a
//! `(timestamp_ms, difficulty)` sample to a fixed ring buffer. Four sliding
//! windows (1m, 10m, 1h, 1d) keep a running sum of the samples they cover, so
//! an update costs only the samples entering and leaving each window instead
//! of a rescan.
//!
//! Indices are "unwrapped": sample `n` is the n-th sample ever pushed and lives
//! in slot `n & (capacity - 1)`. A window covers the samples `first..end`.
//!
//! Hashrate from a difficulty sum: each difficulty-1 share stands for 2^32
//! hashes on average, so `GH/s = sum * 2^32 / seconds / 1e9`.

use std::time::Duration;

use parking_lot::Mutex;

use crate::tracing::prelude::*;

/// Default ring capacity in samples.
pub const DEFAULT_CAPACITY: usize = 0x20000;

/// Nominal spans of the averaging windows.
pub const WINDOW_SPANS: [Duration; 4] = [
    Duration::from_secs(60),
    Duration::from_secs(600),
    Duration::from_secs(3600),
    Duration::from_secs(86400),
];

/// Averaging windows, in [`WINDOW_SPANS`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Window {
    #[strum(serialize = "1m")]
    OneMinute = 0,
    #[strum(serialize = "10m")]
    TenMinutes = 1,
    #[strum(serialize = "1h")]
    OneHour = 2,
    #[strum(serialize = "1d")]
    OneDay = 3,
}

impl Window {
    pub const ALL: [Window; 4] = [
        Window::OneMinute,
        Window::TenMinutes,
        Window::OneHour,
        Window::OneDay,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Ring size in samples; rounded up to a power of two.
    pub capacity: usize,

    pub spans: [Duration; 4],
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            spans: WINDOW_SPANS,
        }
    }
}

/// Running state of one averaging window.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    span_ms: u64,
    first: u64,
    end: u64,
    sum: u64,
    preliminary: bool,
    average_gh: f64,
}

impl HistoryWindow {
    fn new(span: Duration) -> Self {
        Self {
            span_ms: span.as_millis() as u64,
            first: 0,
            end: 0,
            sum: 0,
            preliminary: true,
            average_gh: 0.0,
        }
    }

    /// Sum of the difficulties currently in the window.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Index of the oldest sample in the window.
    pub fn first_sample(&self) -> u64 {
        self.first
    }

    /// Index of the newest sample in the window, if any.
    pub fn last_sample(&self) -> Option<u64> {
        self.end.checked_sub(1)
    }

    /// True until the history has run for the window's full span. The average
    /// reads low during that time since it always divides by at least the span.
    pub fn is_preliminary(&self) -> bool {
        self.preliminary
    }

    pub fn average_gh(&self) -> f64 {
        self.average_gh
    }
}

struct Ring {
    mask: u64,
    shares: Vec<u32>,
    timestamps: Vec<u64>,
    averages: Vec<[f32; 4]>,
    num_samples: u64,
    started_ms: Option<u64>,
    windows: [HistoryWindow; 4],
}

impl Ring {
    fn slot(&self, index: u64) -> usize {
        (index & self.mask) as usize
    }

    fn timestamp(&self, index: u64) -> u64 {
        self.timestamps[self.slot(index)]
    }

    fn share(&self, index: u64) -> u64 {
        u64::from(self.shares[self.slot(index)])
    }

    fn capacity(&self) -> u64 {
        self.mask + 1
    }

    fn oldest(&self) -> u64 {
        self.num_samples.saturating_sub(self.capacity())
    }

    fn push(&mut self, difficulty: u32, timestamp_ms: u64) {
        let index = self.num_samples;

        // The slot about to be reused holds the oldest sample; no window may
        // keep counting it
        if let Some(victim) = index.checked_sub(self.capacity()) {
            let share = self.share(victim);
            for window in self.windows.iter_mut() {
                if window.first == victim && window.first < window.end {
                    window.sum -= share;
                    window.first += 1;
                }
            }
        }

        let slot = self.slot(index);
        self.shares[slot] = difficulty;
        self.timestamps[slot] = timestamp_ms;
        self.num_samples += 1;
        let started = *self.started_ms.get_or_insert(timestamp_ms);

        let mut averages = [0f32; 4];
        for i in 0..self.windows.len() {
            self.update_window(i, started);
            averages[i] = self.windows[i].average_gh as f32;
        }
        self.averages[slot] = averages;
    }

    fn update_window(&mut self, i: usize, started: u64) {
        let mut window = self.windows[i].clone();

        while window.end < self.num_samples {
            window.sum += self.share(window.end);
            window.end += 1;
        }

        let newest = self.timestamp(window.end - 1);
        while window.first < window.end - 1
            && newest.saturating_sub(self.timestamp(window.first)) > window.span_ms
        {
            window.sum -= self.share(window.first);
            window.first += 1;
        }

        if window.preliminary && newest.saturating_sub(started) >= window.span_ms {
            window.preliminary = false;
        }

        let covered = newest.saturating_sub(self.timestamp(window.first));
        let duration_s = covered.max(window.span_ms).max(1) as f64 / 1000.0;
        window.average_gh = (window.sum as f64) * 4_294_967_296.0 / duration_s / 1e9;

        self.windows[i] = window;
    }

    fn search_nearest(&self, timestamp_ms: u64) -> Option<u64> {
        if self.num_samples == 0 {
            return None;
        }
        let (mut low, mut high) = (self.oldest(), self.num_samples);
        if self.timestamp(low) > timestamp_ms {
            return None;
        }
        // First index whose timestamp is after the target
        while low < high {
            let mid = low + (high - low) / 2;
            if self.timestamp(mid) <= timestamp_ms {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Some(low - 1)
    }
}

/// Ring buffer of credited shares with sliding hashrate windows.
pub struct HashrateHistory {
    ring: Mutex<Ring>,
}

impl Default for HashrateHistory {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl HashrateHistory {
    pub fn new(config: HistoryConfig) -> Self {
        let capacity = config.capacity.max(1).next_power_of_two();
        Self {
            ring: Mutex::new(Ring {
                mask: capacity as u64 - 1,
                shares: vec![0; capacity],
                timestamps: vec![0; capacity],
                averages: vec![[0.0; 4]; capacity],
                num_samples: 0,
                started_ms: None,
                windows: config.spans.map(HistoryWindow::new),
            }),
        }
    }

    /// Append a share and update all windows.
    pub fn push_share(&self, difficulty: u32, timestamp_ms: u64) {
        let windows = {
            let mut ring = self.ring.lock();
            ring.push(difficulty, timestamp_ms);
            ring.windows.clone()
        };

        let mark = |w: &HistoryWindow| if w.preliminary { "*" } else { "" };
        debug!(
            m1 = format!("{:.3}{}", windows[0].average_gh, mark(&windows[0])),
            m10 = format!("{:.3}{}", windows[1].average_gh, mark(&windows[1])),
            h1 = format!("{:.3}{}", windows[2].average_gh, mark(&windows[2])),
            d1 = format!("{:.3}{}", windows[3].average_gh, mark(&windows[3])),
            "Hashrate GH/s"
        );
    }

    pub fn num_samples(&self) -> u64 {
        self.ring.lock().num_samples
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity() as usize
    }

    pub fn window(&self, window: Window) -> HistoryWindow {
        self.ring.lock().windows[window.index()].clone()
    }

    /// Current average of a window in GH/s.
    pub fn hashrate_gh(&self, window: Window) -> f64 {
        self.window(window).average_gh
    }

    /// Timestamp of the newest sample.
    pub fn current_timestamp(&self) -> Option<u64> {
        let ring = self.ring.lock();
        ring.num_samples.checked_sub(1).map(|i| ring.timestamp(i))
    }

    /// Oldest and newest retained timestamps plus the retained sample count.
    pub fn timestamps(&self) -> Option<(u64, u64, u64)> {
        let ring = self.ring.lock();
        let last = ring.num_samples.checked_sub(1)?;
        let first = ring.oldest();
        Some((ring.timestamp(first), ring.timestamp(last), last - first + 1))
    }

    /// Index of the newest retained sample at or before `timestamp_ms`.
    ///
    /// `None` if the history is empty or `timestamp_ms` is older than every
    /// retained sample.
    pub fn search_nearest_timestamp(&self, timestamp_ms: u64) -> Option<u64> {
        self.ring.lock().search_nearest(timestamp_ms)
    }

    /// Per-sample averages recorded between `start_ms` and `end_ms`, inclusive.
    ///
    /// Timestamps are relative to `start_ms`; averages are in window order.
    pub fn export(&self, start_ms: u64, end_ms: u64) -> Vec<(u64, [f32; 4])> {
        let ring = self.ring.lock();
        if ring.num_samples == 0 || end_ms < start_ms {
            return Vec::new();
        }

        let first = match ring.search_nearest(start_ms) {
            Some(i) if ring.timestamp(i) >= start_ms => i,
            Some(i) => i + 1,
            None => ring.oldest(),
        };

        (first..ring.num_samples)
            .map(|i| (ring.timestamp(i), ring.averages[ring.slot(i)]))
            .take_while(|(ts, _)| *ts <= end_ms)
            .map(|(ts, averages)| (ts - start_ms, averages))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn history(capacity: usize, spans_ms: [u64; 4]) -> HashrateHistory {
        HashrateHistory::new(HistoryConfig {
            capacity,
            spans: spans_ms.map(Duration::from_millis),
        })
    }

    #[test]
    fn window_evicts_samples_older_than_span() {
        let h = history(16, [1500, 1500, 1500, 1500]);
        h.push_share(100, 0);
        h.push_share(100, 1000);
        h.push_share(100, 2000);

        let w = h.window(Window::OneMinute);
        assert_eq!(w.sum(), 200);
        assert_eq!(w.first_sample(), 1);
        assert_eq!(w.last_sample(), Some(2));
    }

    #[test]
    fn boundary_sample_is_kept() {
        let h = history(16, [1000; 4]);
        h.push_share(1, 0);
        h.push_share(1, 1000);
        assert_eq!(h.window(Window::OneMinute).sum(), 2);
        h.push_share(1, 1001);
        assert_eq!(h.window(Window::OneMinute).sum(), 2);
    }

    #[test]
    fn sums_match_brute_force() {
        let spans = [700, 2_500, 9_000, 40_000];
        let h = history(1024, spans);
        let mut samples = Vec::new();
        let mut ts = 0u64;

        for n in 0..600u64 {
            // Uneven gaps, some repeated timestamps
            ts += (n * 7919) % 137;
            let diff = ((n * 31) % 1000 + 1) as u32;
            h.push_share(diff, ts);
            samples.push((ts, u64::from(diff)));

            for (window, span) in Window::ALL.iter().zip(spans) {
                let expected: u64 = samples
                    .iter()
                    .filter(|(t, _)| *t + span >= ts && *t <= ts)
                    .map(|(_, d)| d)
                    .sum();
                assert_eq!(h.window(*window).sum(), expected, "{window} after {n}");
            }
        }
    }

    #[test]
    fn preliminary_latches_once_span_has_elapsed() {
        let h = history(16, [1000; 4]);
        h.push_share(10, 0);
        assert!(h.window(Window::OneMinute).is_preliminary());

        h.push_share(10, 1000);
        assert!(!h.window(Window::OneMinute).is_preliminary());

        // A long gap leaves one sample covering no time; still final
        h.push_share(10, 5000);
        assert!(!h.window(Window::OneMinute).is_preliminary());
    }

    #[test]
    fn average_divides_by_at_least_the_span() {
        let h = history(16, [1000, 2000, 4000, 8000]);
        h.push_share(1000, 0);
        h.push_share(1000, 500);

        // 2000 * 2^32 hashes over one second
        let expected = 2000.0 * 4_294_967_296.0 / 1e9;
        assert!((h.hashrate_gh(Window::OneMinute) - expected).abs() < 1e-6);
        assert!((h.hashrate_gh(Window::TenMinutes) - expected / 2.0).abs() < 1e-6);
    }

    #[test]
    fn overwritten_slot_leaves_long_windows() {
        let h = history(4, [2, 1_000_000, 1_000_000, 1_000_000]);
        for ts in 0..6u64 {
            h.push_share(1, ts);
        }
        // Only the four retained samples are counted
        let w = h.window(Window::OneDay);
        assert_eq!(w.sum(), 4);
        assert_eq!(w.first_sample(), 2);
        let short = h.window(Window::OneMinute);
        assert_eq!(short.sum(), 3);
        assert_eq!(short.first_sample(), 3);
        assert_eq!(h.timestamps(), Some((2, 5, 4)));
    }

    #[test]
    fn search_on_empty_history() {
        let h = history(16, [1000; 4]);
        assert_eq!(h.search_nearest_timestamp(1000), None);
        assert_eq!(h.timestamps(), None);
        assert!(h.export(0, 10_000).is_empty());
    }

    #[test]
    fn search_single_sample() {
        let h = history(16, [1000; 4]);
        h.push_share(1, 500);
        assert_eq!(h.search_nearest_timestamp(1000), Some(0));
        assert_eq!(h.search_nearest_timestamp(500), Some(0));
        assert_eq!(h.search_nearest_timestamp(499), None);
    }

    #[test_case(0, None)]
    #[test_case(100, Some(0))]
    #[test_case(150, Some(0))]
    #[test_case(200, Some(1))]
    #[test_case(699, Some(5))]
    #[test_case(10_000, Some(9))]
    fn search_finds_sample_at_or_before(ts: u64, expected: Option<u64>) {
        let h = history(16, [1000; 4]);
        for i in 1..=10 {
            h.push_share(1, i * 100);
        }
        assert_eq!(h.search_nearest_timestamp(ts), expected);
    }

    #[test]
    fn search_honors_wraparound() {
        let h = history(8, [1000; 4]);
        for i in 0..20u64 {
            h.push_share(1, i * 10);
        }
        // Samples 12..20 are retained
        assert_eq!(h.search_nearest_timestamp(115), None);
        assert_eq!(h.search_nearest_timestamp(120), Some(12));
        assert_eq!(h.search_nearest_timestamp(175), Some(17));
        assert_eq!(h.search_nearest_timestamp(1000), Some(19));
    }

    #[test]
    fn export_returns_relative_range() {
        let h = history(16, [1000; 4]);
        for i in 0..10u64 {
            h.push_share(1000, i * 100);
        }

        let rows = h.export(250, 600);
        let times: Vec<u64> = rows.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![50, 150, 250, 350]);
        assert!(rows.iter().all(|(_, avg)| avg[0] > 0.0));

        // Start before the oldest sample begins at the oldest
        assert_eq!(h.export(0, 50).len(), 1);
        assert!(h.export(600, 100).is_empty());
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(history(100, [1000; 4]).capacity(), 128);
        assert_eq!(HashrateHistory::default().capacity(), DEFAULT_CAPACITY);
    }
}
