// THEORY:
// The `ThresholdCalibrator` is the adaptive control loop of the trigger. Sensor
// noise drifts with temperature, light leaks and battery state, so a fixed L1
// threshold would either flood the uplink or go silent. Instead the calibrator
// watches the peak intensity of every frame that reaches L1 and, when asked,
// picks the threshold that would have passed the configured number of events
// per minute over the recent window.
//
// Key architectural principles:
// 1.  **One lock, one snapshot**: the sample window, its histogram and the frame
//     rate estimate live behind a single mutex. A recompute sees a consistent
//     view and holds the lock only for one O(nbins) scan.
// 2.  **Top-down tail scan**: starting from the brightest bin, the scan adds
//     bins to the tail while the tail stays within `target_rate * samples` and
//     returns the smallest threshold that satisfies it. A frame passes L1 when
//     its peak is strictly above the threshold.
// 3.  **Fractional thresholds**: the whole tail budget is rarely an integer
//     number of bins. The remainder becomes a fractional part that L1 turns
//     into a probabilistic accept at the boundary bin.
// 4.  **Live vs. snapshotted**: the calibrator owns the live thresholds. Blocks
//     copy them when they are created; stages only ever read the block copy.

use crate::core_modules::frame::{AcquisitionTime, INTENSITY_LEVELS};
use crate::core_modules::histogram::Histogram;
use crate::core_modules::rolling_window::RollingSampleWindow;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How many recent frame timestamps feed the frame rate estimate.
const FPS_WINDOW: usize = 64;
/// Below this, fractional thresholds are rounded up to whole bins.
const MIN_FRACTIONAL_THRESHOLD: f64 = 3.0;
/// Highest meaningful threshold for 8-bit intensities.
pub const MAX_THRESHOLD: f64 = (INTENSITY_LEVELS - 1) as f64;

/// The pair of thresholds a block runs with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Peak intensity a frame must exceed at L1. May carry a fractional part.
    pub l1: f64,
    /// Pixel value a candidate must exceed at L2.
    pub l2: u8,
}

/// What gets committed to the export collaborator when calibration ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub run_id: u64,
    pub taken: AcquisitionTime,
    pub samples: usize,
    pub fps: f64,
    pub target_events_per_minute: f64,
    pub thresholds: Thresholds,
    /// Peak-intensity histogram, one bin per intensity level.
    pub histogram: Vec<i64>,
    pub overflow: i64,
}

struct CalibratorInner {
    window: RollingSampleWindow,
    frame_times: VecDeque<u64>,
}

impl CalibratorInner {
    fn fps(&self) -> f64 {
        if self.frame_times.len() < 2 {
            return 0.0;
        }
        // Workers finish frames out of order; only the span matters.
        let first = self.frame_times.iter().min().copied().unwrap_or(0);
        let last = self.frame_times.iter().max().copied().unwrap_or(0);
        let span_secs = (last - first) as f64 / 1e9;
        if span_secs <= 0.0 {
            0.0
        } else {
            (self.frame_times.len() - 1) as f64 / span_secs
        }
    }
}

pub struct ThresholdCalibrator {
    inner: Mutex<CalibratorInner>,
    thresholds: RwLock<Thresholds>,
    l2_min_threshold: u8,
}

impl ThresholdCalibrator {
    pub fn new(window_size: usize, l2_min_threshold: u8, initial_l1: f64) -> Self {
        Self {
            inner: Mutex::new(CalibratorInner {
                window: RollingSampleWindow::new(window_size, INTENSITY_LEVELS),
                frame_times: VecDeque::with_capacity(FPS_WINDOW),
            }),
            thresholds: RwLock::new(Thresholds {
                l1: initial_l1,
                l2: derive_l2(initial_l1, l2_min_threshold),
            }),
            l2_min_threshold,
        }
    }

    /// Records one frame's peak intensity and acquisition time.
    pub fn add_frame(&self, peak: u8, acquired_nanos: u64) {
        let mut inner = self.inner.lock();
        inner.window.add(peak as i64);
        if inner.frame_times.len() >= FPS_WINDOW {
            inner.frame_times.pop_front();
        }
        inner.frame_times.push_back(acquired_nanos);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.window.clear();
        inner.frame_times.clear();
    }

    pub fn resize(&self, window_size: usize) {
        self.inner.lock().window.resize(window_size);
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().window.len()
    }

    pub fn fps(&self) -> f64 {
        self.inner.lock().fps()
    }

    pub fn histogram(&self) -> Histogram {
        self.inner.lock().window.histogram().clone()
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read()
    }

    /// Sets L1 by hand and derives L2 from it. Values outside the pixel range
    /// are clamped into it.
    pub fn set_l1_threshold(&self, l1: f64) {
        let clamped = l1.max(0.0).min(MAX_THRESHOLD);
        if clamped != l1 {
            log::warn!("L1 threshold {} is outside 0..={}, using {}", l1, MAX_THRESHOLD, clamped);
        }
        let l1 = clamped;
        *self.thresholds.write() = Thresholds {
            l1,
            l2: derive_l2(l1, self.l2_min_threshold),
        };
    }

    pub fn set_l2_threshold(&self, l2: u8) {
        self.thresholds.write().l2 = l2;
    }

    /// Threshold the current window would yield for a per-frame pass
    /// probability of `rate`.
    pub fn threshold_for_rate(&self, rate: f64, prescale: bool) -> Option<f64> {
        let inner = self.inner.lock();
        compute_threshold(inner.window.histogram(), rate, prescale)
    }

    /// Recomputes the live thresholds so that roughly
    /// `target_events_per_minute` frames pass L1. Returns the new thresholds, or
    /// `None` when they were left untouched.
    pub fn update_thresholds(
        &self,
        target_events_per_minute: f64,
        prescale: bool,
        trigger_lock: bool,
    ) -> Option<Thresholds> {
        if trigger_lock {
            log::info!("trigger lock engaged, keeping thresholds {:?}", self.thresholds());
            return None;
        }
        let computed = {
            let inner = self.inner.lock();
            let fps = inner.fps();
            if fps <= 0.0 {
                log::warn!(
                    "cannot calibrate with fps = {} ({} samples); keeping thresholds",
                    fps,
                    inner.window.len()
                );
                return None;
            }
            let rate = target_events_per_minute / 60.0 / fps;
            compute_threshold(inner.window.histogram(), rate, prescale)
        };

        match computed {
            Some(l1) => {
                self.set_l1_threshold(l1);
                let thresholds = self.thresholds();
                log::info!(
                    "thresholds updated: L1 = {:.3}, L2 = {}",
                    thresholds.l1,
                    thresholds.l2
                );
                Some(thresholds)
            }
            None => {
                log::warn!("calibration window is empty; keeping thresholds");
                None
            }
        }
    }

    pub fn summary(&self, run_id: u64, target_events_per_minute: f64) -> CalibrationSummary {
        let inner = self.inner.lock();
        let histogram = inner.window.histogram();
        CalibrationSummary {
            run_id,
            taken: AcquisitionTime::now(0),
            samples: inner.window.len(),
            fps: inner.fps(),
            target_events_per_minute,
            thresholds: self.thresholds(),
            histogram: histogram.values().to_vec(),
            overflow: histogram.overflow(),
        }
    }
}

/// Threshold for a per-frame pass probability `rate` over the samples in
/// `histogram`. `None` when there are no samples.
pub fn compute_threshold(histogram: &Histogram, rate: f64, prescale: bool) -> Option<f64> {
    let total = histogram.integral() + histogram.overflow();
    if total <= 0 {
        return None;
    }
    // Snap to 1e-6 so `rate * total` lands on whole counts when it should.
    let target = (rate.max(0.0) * total as f64 * 1e6).round() / 1e6;
    let (threshold, above) = histogram.tail_threshold(target);
    if !prescale {
        return Some(threshold as f64);
    }

    let boundary = histogram.bin_value(threshold);
    let fraction = if boundary > 0 {
        ((target - above as f64) / boundary as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let effective = threshold as f64 - fraction;
    if effective < MIN_FRACTIONAL_THRESHOLD {
        Some(effective.ceil().max(0.0))
    } else {
        Some(effective)
    }
}

/// L2 runs one below L1 so that its coarse window always covers L1's, but never
/// below the protective floor.
pub fn derive_l2(l1: f64, floor: u8) -> u8 {
    let below = (l1.ceil() - 1.0).clamp(0.0, 255.0) as u8;
    below.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1000 peaks: 950 spread over 50..=200 (some exactly at 200) and 50 above 200.
    fn scenario_histogram() -> Histogram {
        let mut hist = Histogram::new(INTENSITY_LEVELS);
        for i in 0..950 {
            hist.fill(50 + (i % 151));
        }
        for i in 0..50 {
            hist.fill(201 + (i % 55));
        }
        hist
    }

    #[test]
    fn five_percent_of_a_thousand_selects_200() {
        let hist = scenario_histogram();
        assert_eq!(hist.range_sum(201, 255, true), 50);
        assert_eq!(compute_threshold(&hist, 0.05, false), Some(200.0));
        assert_eq!(compute_threshold(&hist, 0.05, true), Some(200.0));
    }

    #[test]
    fn threshold_is_monotonic_in_target_rate() {
        let hist = scenario_histogram();
        // r = 5% of samples exceed v = 200.
        for target in [0.05, 0.06, 0.2, 0.5] {
            let t = compute_threshold(&hist, target, true).unwrap();
            assert!(t <= 200.0, "target {} gave {}", target, t);
        }
        for target in [0.049, 0.02, 0.001] {
            let t = compute_threshold(&hist, target, true).unwrap();
            assert!(t > 200.0, "target {} gave {}", target, t);
        }
        let mut last = f64::MAX;
        for step in 1..100 {
            let t = compute_threshold(&hist, step as f64 / 100.0, true).unwrap();
            assert!(t <= last);
            last = t;
        }
    }

    #[test]
    fn fractional_threshold_splits_the_boundary_bin() {
        let mut hist = Histogram::new(INTENSITY_LEVELS);
        hist.fill_weighted(10, 90);
        hist.fill_weighted(20, 10);
        // A budget of 15 takes all of bin 20 and 5 of the 90 frames in bin 10.
        let t = compute_threshold(&hist, 0.15, true).unwrap();
        assert!((t - 9.944_444).abs() < 1e-4, "got {}", t);
        assert_eq!(compute_threshold(&hist, 0.15, false), Some(10.0));
    }

    #[test]
    fn empty_window_yields_no_threshold() {
        let hist = Histogram::new(INTENSITY_LEVELS);
        assert_eq!(compute_threshold(&hist, 0.5, true), None);
    }

    #[test]
    fn zero_fps_keeps_thresholds() {
        let calibrator = ThresholdCalibrator::new(100, 2, 40.0);
        calibrator.add_frame(10, 1_000);
        calibrator.add_frame(12, 1_000);
        assert_eq!(calibrator.fps(), 0.0);
        assert_eq!(calibrator.update_thresholds(60.0, true, false), None);
        assert_eq!(calibrator.thresholds().l1, 40.0);
    }

    #[test]
    fn update_uses_frame_rate_and_derives_l2() {
        let calibrator = ThresholdCalibrator::new(1000, 2, 255.0);
        // 10 fps for 100 s; 1 frame in 10 is bright.
        for i in 0..1000u64 {
            let peak = if i % 10 == 0 { 100 } else { 20 };
            calibrator.add_frame(peak, i * 100_000_000);
        }
        // 60/min at 10 fps = 10% of frames.
        let thresholds = calibrator.update_thresholds(60.0, false, false).unwrap();
        assert_eq!(thresholds.l1, 20.0);
        assert_eq!(thresholds.l2, 19);

        calibrator.set_l1_threshold(1.0);
        assert_eq!(calibrator.thresholds().l2, 2);
    }

    #[test]
    fn trigger_lock_freezes_thresholds() {
        let calibrator = ThresholdCalibrator::new(10, 2, 77.0);
        for i in 0..10u64 {
            calibrator.add_frame(5, i * 1_000_000);
        }
        assert_eq!(calibrator.update_thresholds(60.0, true, true), None);
        assert_eq!(calibrator.thresholds().l1, 77.0);
    }

    #[test]
    fn manual_threshold_is_clamped_to_pixel_range() {
        let calibrator = ThresholdCalibrator::new(10, 2, 40.0);
        calibrator.set_l1_threshold(1e18);
        assert_eq!(calibrator.thresholds(), Thresholds { l1: 255.0, l2: 254 });
        calibrator.set_l1_threshold(-4.0);
        assert_eq!(calibrator.thresholds(), Thresholds { l1: 0.0, l2: 2 });
        calibrator.set_l1_threshold(f64::NAN);
        assert_eq!(calibrator.thresholds().l1, 0.0);
    }

    #[test]
    fn calibration_summary_round_trips_exactly() {
        let calibrator = ThresholdCalibrator::new(100, 2, 255.0);
        for i in 0..30u64 {
            calibrator.add_frame((i % 7) as u8 * 30, i * 33_333_333);
        }
        calibrator.set_l1_threshold(199.0 + 17.0 / 18.0);
        let summary = calibrator.summary(42, 100.0 / 3.0);

        let json = serde_json::to_string(&summary).unwrap();
        let back: CalibrationSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
        assert_eq!(back.thresholds.l1.to_bits(), summary.thresholds.l1.to_bits());
        assert_eq!(back.fps.to_bits(), summary.fps.to_bits());
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
