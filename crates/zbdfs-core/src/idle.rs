//! Idle detection.
//!
//! The wear-leveling worker only runs while the device looks idle.
//! [`IdleDetector::judge_qps_trend`] samples the QPS meters over two
//! short windows and classifies the trend; its thresholds adapt upward
//! when the verdict keeps failing on a loaded device and snap back to the
//! defaults after a streak of successes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::metrics::{QpsKind, QpsMeter};

/// Default write QPS below which the device counts as idle.
pub const DEFAULT_IDLE_QPS_WRITE_THRESHOLD: u64 = 76;

/// Default read QPS below which the device counts as idle.
pub const DEFAULT_IDLE_QPS_READ_THRESHOLD: u64 = 5000;

/// Sampling window for one half of a trend judgement.
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Verdict streak length that adapts the thresholds.
const ADAPT_STREAK: u32 = 5;

/// Tunables for an [`IdleDetector`].
#[derive(Debug, Clone, Copy)]
pub struct IdleDetectorConfig {
    pub write_threshold: u64,
    pub read_threshold: u64,
    /// Length of each of the two sampling windows.
    pub sample_interval: Duration,
}

impl Default for IdleDetectorConfig {
    fn default() -> Self {
        Self {
            write_threshold: DEFAULT_IDLE_QPS_WRITE_THRESHOLD,
            read_threshold: DEFAULT_IDLE_QPS_READ_THRESHOLD,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

/// Samples recent read/write QPS to classify the device as idle or busy.
pub struct IdleDetector {
    qps: Arc<dyn QpsMeter>,
    write_threshold: u64,
    read_threshold: u64,
    default_write_threshold: u64,
    default_read_threshold: u64,
    sample_interval: Duration,
    window_write_max: u64,
    window_read_max: u64,
    fail_count: u32,
    success_count: u32,
}

impl std::fmt::Debug for IdleDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleDetector")
            .field("write_threshold", &self.write_threshold)
            .field("read_threshold", &self.read_threshold)
            .field("fail_count", &self.fail_count)
            .field("success_count", &self.success_count)
            .finish_non_exhaustive()
    }
}

impl IdleDetector {
    #[must_use]
    pub fn new(qps: Arc<dyn QpsMeter>, config: IdleDetectorConfig) -> Self {
        Self {
            qps,
            write_threshold: config.write_threshold,
            read_threshold: config.read_threshold,
            default_write_threshold: config.write_threshold,
            default_read_threshold: config.read_threshold,
            sample_interval: config.sample_interval,
            window_write_max: 0,
            window_read_max: 0,
            fail_count: 0,
            success_count: 0,
        }
    }

    /// Whether the device is idle enough to wear-level right now.
    ///
    /// Samples two consecutive windows, adapts the thresholds on verdict
    /// streaks, and classifies the trend. Sleeps for two sample
    /// intervals.
    pub fn judge_qps_trend(&mut self) -> bool {
        self.qps.clear_now();
        thread::sleep(self.sample_interval);
        let write1 = self.qps.now(QpsKind::Write);
        let read1 = self.qps.now(QpsKind::Read);

        self.qps.clear_now();
        thread::sleep(self.sample_interval);
        let write2 = self.qps.now(QpsKind::Write);
        let read2 = self.qps.now(QpsKind::Read);

        self.window_write_max = self.window_write_max.max(write1.max(write2));
        self.window_read_max = self.window_read_max.max(read1.max(read2));

        // A streak of busy verdicts means the thresholds sit below the
        // device's baseline; pull them toward the observed maxima.
        if self.fail_count >= ADAPT_STREAK {
            if self.window_write_max > self.write_threshold {
                self.write_threshold = (self.write_threshold + self.window_write_max) / 2;
            }
            if self.window_read_max > self.read_threshold {
                self.read_threshold = (self.read_threshold + self.window_read_max) / 2;
            }
            debug!(
                target: "zbdfs::idle",
                event = "thresholds_raised",
                write_threshold = self.write_threshold,
                read_threshold = self.read_threshold
            );
            self.window_write_max = 0;
            self.window_read_max = 0;
            self.fail_count = 0;
        }

        // Any one non-default threshold plus a streak of idle verdicts
        // snaps both back to the defaults.
        if ((self.write_threshold != self.default_write_threshold)
            || (self.read_threshold != self.default_read_threshold))
            && self.success_count >= ADAPT_STREAK
        {
            self.write_threshold = self.default_write_threshold;
            self.read_threshold = self.default_read_threshold;
            self.success_count = 0;
            debug!(target: "zbdfs::idle", event = "thresholds_reset");
        }

        let idle = self.verdict(write1, read1, write2, read2);
        if idle {
            self.success_count += 1;
            self.fail_count = 0;
        } else {
            self.fail_count += 1;
            self.success_count = 0;
        }
        idle
    }

    fn verdict(&self, write1: u64, read1: u64, write2: u64, read2: u64) -> bool {
        let write_thr = self.write_threshold;
        let read_thr = self.read_threshold;

        if write1 < write_thr && write2 < write_thr {
            if read1 < read_thr && read2 < read_thr {
                return true;
            }
            if read2 > read1 {
                return false;
            }
            // Reads falling off a cliff: idle is imminent.
            if 100 * (read1 - read2) > read_thr * 5 {
                return true;
            }
            false
        } else {
            if write2 > write1 {
                return false;
            }
            if read1 < read_thr && read2 < read_thr && 100 * (write1 - write2) > write_thr * 5 {
                return true;
            }
            false
        }
    }

    #[must_use]
    pub fn write_threshold(&self) -> u64 {
        self.write_threshold
    }

    #[must_use]
    pub fn read_threshold(&self) -> u64 {
        self.read_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Meter whose windows replay a script: every `clear_now` advances to
    /// the next `(write, read)` pair, which `now` then reports.
    struct ScriptedQpsMeter {
        windows: Mutex<VecDeque<(u64, u64)>>,
        current: Mutex<(u64, u64)>,
    }

    impl ScriptedQpsMeter {
        fn new(windows: &[(u64, u64)]) -> Arc<Self> {
            Arc::new(Self {
                windows: Mutex::new(windows.iter().copied().collect()),
                current: Mutex::new((0, 0)),
            })
        }
    }

    impl QpsMeter for ScriptedQpsMeter {
        fn report(&self, _kind: QpsKind, _n: u64) {}

        fn clear_now(&self) {
            *self.current.lock() = self.windows.lock().pop_front().unwrap_or((0, 0));
        }

        fn now(&self, kind: QpsKind) -> u64 {
            let (write, read) = *self.current.lock();
            match kind {
                QpsKind::Write => write,
                QpsKind::Read => read,
            }
        }
    }

    fn detector(meter: Arc<ScriptedQpsMeter>) -> IdleDetector {
        IdleDetector::new(
            meter,
            IdleDetectorConfig {
                sample_interval: Duration::from_millis(1),
                ..IdleDetectorConfig::default()
            },
        )
    }

    #[test]
    fn quiet_device_is_idle() {
        let mut detector = detector(ScriptedQpsMeter::new(&[(0, 0), (0, 0)]));
        assert!(detector.judge_qps_trend());
    }

    #[test]
    fn rising_writes_are_busy() {
        let mut detector = detector(ScriptedQpsMeter::new(&[(100, 0), (200, 0)]));
        assert!(!detector.judge_qps_trend());
    }

    #[test]
    fn sharply_falling_writes_are_idle() {
        let mut detector = detector(ScriptedQpsMeter::new(&[(1000, 0), (100, 0)]));
        assert!(detector.judge_qps_trend());
    }

    #[test]
    fn rising_reads_are_busy() {
        let mut detector = detector(ScriptedQpsMeter::new(&[(0, 100), (0, 6000)]));
        assert!(!detector.judge_qps_trend());
    }

    #[test]
    fn sharply_falling_reads_are_idle() {
        let mut detector = detector(ScriptedQpsMeter::new(&[(0, 9000), (0, 100)]));
        assert!(detector.judge_qps_trend());
    }

    #[test]
    fn mildly_falling_reads_are_busy() {
        // Both writes idle, reads above threshold but not falling fast
        // enough: 100 * (5500 - 5400) = 10_000 <= 25_000.
        let mut detector = detector(ScriptedQpsMeter::new(&[(0, 5500), (0, 5400)]));
        assert!(!detector.judge_qps_trend());
    }

    #[test]
    fn fail_streak_raises_thresholds() {
        let windows: Vec<(u64, u64)> = std::iter::repeat((200, 0)).take(12).collect();
        let mut detector = detector(ScriptedQpsMeter::new(&windows));

        for _ in 0..6 {
            assert!(!detector.judge_qps_trend());
        }
        // After five consecutive fails, the sixth call pulls the write
        // threshold toward the window max: (76 + 200) / 2.
        assert_eq!(detector.write_threshold(), 138);
        assert_eq!(detector.read_threshold(), DEFAULT_IDLE_QPS_READ_THRESHOLD);
    }

    #[test]
    fn success_streak_resets_thresholds_to_defaults() {
        let mut detector = detector(ScriptedQpsMeter::new(&[]));
        detector.write_threshold = 500;

        for _ in 0..6 {
            assert!(detector.judge_qps_trend());
        }
        assert_eq!(detector.write_threshold(), DEFAULT_IDLE_QPS_WRITE_THRESHOLD);
        assert_eq!(detector.read_threshold(), DEFAULT_IDLE_QPS_READ_THRESHOLD);
    }

    #[test]
    fn success_resets_fail_streak() {
        let mut windows: Vec<(u64, u64)> = std::iter::repeat((200, 0)).take(6).collect();
        windows.extend([(0, 0), (0, 0)]);
        let mut detector = detector(ScriptedQpsMeter::new(&windows));

        for _ in 0..3 {
            assert!(!detector.judge_qps_trend());
        }
        assert_eq!(detector.fail_count, 3);

        assert!(detector.judge_qps_trend());
        assert_eq!(detector.fail_count, 0);
        assert_eq!(detector.success_count, 1);
    }
}
