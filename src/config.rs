//! Runtime configuration for the acquisition pipeline.
//!
//! Loaded from `DAQ_*` environment variables with defaults for everything. A
//! value that does not parse is logged and replaced by its default; loading
//! never fails. The pipeline shares one `DaqConfig` behind a lock so remote
//! commands can change it while frames are flowing.

use crate::core_modules::l1_trigger::L1Config;
use crate::core_modules::precalibration::{PrecalStep, PrecalStepKind, parse_steps};
use crate::core_modules::trigger_config::TriggerConfig;
use parking_lot::RwLock;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub type SharedConfig = Arc<RwLock<DaqConfig>>;

#[derive(Debug, Clone, PartialEq)]
pub struct DaqConfig {
    /// Stage option strings, `name;key=value;...`.
    pub l0_trigger: String,
    pub quality_trigger: String,
    /// Precalibration steps, `step -> step`.
    pub precal_trigger: String,
    pub l1_trigger: String,
    pub l2_trigger: String,

    /// Frames per minute L1 should pass in DATA.
    pub target_events_per_minute: f64,
    /// Good frames SURVEY needs before moving on.
    pub survey_sample_frames: u64,
    pub calibration_sample_frames: u64,
    pub stabilization_sample_frames: u64,
    /// Overrides for the precalibration steps.
    pub weighting_sample_frames: Option<u64>,
    pub hotcell_sample_frames: Option<u64>,
    pub hotcell_thresh: Option<f64>,
    pub calibrator_window: usize,
    pub l2_min_threshold: u8,
    /// Keep the thresholds where they are on every recalibration.
    pub trigger_lock: bool,

    pub block_period: Duration,
    pub stale_timeout: Duration,
    pub finalize_grace: Duration,
    pub flush_interval: Duration,
    pub quality_debounce_frames: u32,
    pub pass_rate_window: usize,
    pub pass_rate_tolerance: f64,
    pub recent_events: usize,

    pub worker_threads: usize,
    pub sensor_slots: usize,
    pub sensor_width: u32,
    pub sensor_height: u32,
    /// Bytes of claimed planes allowed at once.
    pub claim_budget_bytes: usize,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            l0_trigger: "default;prescale=0.001;random=true;windowsize=10".to_string(),
            quality_trigger: "facedown;orient=10;mean=10;std=255".to_string(),
            precal_trigger: "hotcell;maxframes=1000;thresh=0.0002 -> weighting;maxframes=500;downsample=8"
                .to_string(),
            l1_trigger: "default;thresh=255;prescale=true".to_string(),
            l2_trigger: "default;npix=500".to_string(),
            target_events_per_minute: 60.0,
            survey_sample_frames: 45,
            calibration_sample_frames: 1000,
            stabilization_sample_frames: 45,
            weighting_sample_frames: None,
            hotcell_sample_frames: None,
            hotcell_thresh: None,
            calibrator_window: 1000,
            l2_min_threshold: 2,
            trigger_lock: false,
            block_period: Duration::from_secs(120),
            stale_timeout: Duration::from_secs(30),
            finalize_grace: Duration::from_millis(2500),
            flush_interval: Duration::from_secs(1),
            quality_debounce_frames: 3,
            pass_rate_window: 25,
            pass_rate_tolerance: 1.5,
            recent_events: 25,
            worker_threads: num_cpus::get(),
            sensor_slots: 4,
            sensor_width: 640,
            sensor_height: 480,
            claim_budget_bytes: 64 << 20,
        }
    }
}

impl DaqConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (defaults in `Default`):
    /// - `DAQ_L0_TRIGGER`, `DAQ_QUALITY_TRIGGER`, `DAQ_PRECAL_TRIGGER`,
    ///   `DAQ_L1_TRIGGER`, `DAQ_L2_TRIGGER`
    /// - `DAQ_TARGET_EVENTS_PER_MINUTE`
    /// - `DAQ_SURVEY_SAMPLE_FRAMES`, `DAQ_CALIBRATION_SAMPLE_FRAMES`,
    ///   `DAQ_STABILIZATION_SAMPLE_FRAMES`, `DAQ_WEIGHTING_SAMPLE_FRAMES`,
    ///   `DAQ_HOTCELL_SAMPLE_FRAMES`, `DAQ_HOTCELL_THRESH`
    /// - `DAQ_CALIBRATOR_WINDOW`, `DAQ_L2_MIN_THRESHOLD`, `DAQ_TRIGGER_LOCK`
    /// - `DAQ_BLOCK_PERIOD_SECS`, `DAQ_STALE_TIMEOUT_SECS`,
    ///   `DAQ_FINALIZE_GRACE_MS`, `DAQ_FLUSH_INTERVAL_MS`
    /// - `DAQ_QUALITY_DEBOUNCE_FRAMES`, `DAQ_PASS_RATE_WINDOW`,
    ///   `DAQ_PASS_RATE_TOLERANCE`, `DAQ_RECENT_EVENTS`
    /// - `DAQ_WORKER_THREADS`, `DAQ_SENSOR_SLOTS`, `DAQ_SENSOR_WIDTH`,
    ///   `DAQ_SENSOR_HEIGHT`, `DAQ_CLAIM_BUDGET_BYTES`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reads from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);
        let parsed = |key: &str| lookup(key).map(|raw| (key.to_string(), raw));

        Self {
            l0_trigger: text("DAQ_L0_TRIGGER", d.l0_trigger),
            quality_trigger: text("DAQ_QUALITY_TRIGGER", d.quality_trigger),
            precal_trigger: text("DAQ_PRECAL_TRIGGER", d.precal_trigger),
            l1_trigger: text("DAQ_L1_TRIGGER", d.l1_trigger),
            l2_trigger: text("DAQ_L2_TRIGGER", d.l2_trigger),
            target_events_per_minute: or_default(
                parsed("DAQ_TARGET_EVENTS_PER_MINUTE"),
                d.target_events_per_minute,
            ),
            survey_sample_frames: or_default(parsed("DAQ_SURVEY_SAMPLE_FRAMES"), d.survey_sample_frames),
            calibration_sample_frames: or_default(
                parsed("DAQ_CALIBRATION_SAMPLE_FRAMES"),
                d.calibration_sample_frames,
            ),
            stabilization_sample_frames: or_default(
                parsed("DAQ_STABILIZATION_SAMPLE_FRAMES"),
                d.stabilization_sample_frames,
            ),
            weighting_sample_frames: optional(parsed("DAQ_WEIGHTING_SAMPLE_FRAMES")),
            hotcell_sample_frames: optional(parsed("DAQ_HOTCELL_SAMPLE_FRAMES")),
            hotcell_thresh: optional(parsed("DAQ_HOTCELL_THRESH")),
            calibrator_window: or_default(parsed("DAQ_CALIBRATOR_WINDOW"), d.calibrator_window),
            l2_min_threshold: or_default(parsed("DAQ_L2_MIN_THRESHOLD"), d.l2_min_threshold),
            trigger_lock: or_default(parsed("DAQ_TRIGGER_LOCK"), d.trigger_lock),
            block_period: Duration::from_secs(or_default(
                parsed("DAQ_BLOCK_PERIOD_SECS"),
                d.block_period.as_secs(),
            )),
            stale_timeout: Duration::from_secs(or_default(
                parsed("DAQ_STALE_TIMEOUT_SECS"),
                d.stale_timeout.as_secs(),
            )),
            finalize_grace: Duration::from_millis(or_default(
                parsed("DAQ_FINALIZE_GRACE_MS"),
                d.finalize_grace.as_millis() as u64,
            )),
            flush_interval: Duration::from_millis(or_default(
                parsed("DAQ_FLUSH_INTERVAL_MS"),
                d.flush_interval.as_millis() as u64,
            )),
            quality_debounce_frames: or_default(
                parsed("DAQ_QUALITY_DEBOUNCE_FRAMES"),
                d.quality_debounce_frames,
            ),
            pass_rate_window: or_default(parsed("DAQ_PASS_RATE_WINDOW"), d.pass_rate_window),
            pass_rate_tolerance: or_default(parsed("DAQ_PASS_RATE_TOLERANCE"), d.pass_rate_tolerance),
            recent_events: or_default(parsed("DAQ_RECENT_EVENTS"), d.recent_events),
            worker_threads: or_default(parsed("DAQ_WORKER_THREADS"), d.worker_threads).max(1),
            sensor_slots: or_default(parsed("DAQ_SENSOR_SLOTS"), d.sensor_slots).max(1),
            sensor_width: or_default(parsed("DAQ_SENSOR_WIDTH"), d.sensor_width),
            sensor_height: or_default(parsed("DAQ_SENSOR_HEIGHT"), d.sensor_height),
            claim_budget_bytes: or_default(parsed("DAQ_CLAIM_BUDGET_BYTES"), d.claim_budget_bytes),
        }
    }

    pub fn l1_config(&self) -> L1Config {
        L1Config::from_trigger(&TriggerConfig::parse(&self.l1_trigger))
    }

    /// Precalibration steps with the per-step overrides applied.
    pub fn precal_steps(&self) -> Vec<PrecalStep> {
        parse_steps(&self.precal_trigger)
            .into_iter()
            .map(|mut step| {
                match &mut step.kind {
                    PrecalStepKind::HotCell { fraction } => {
                        if let Some(frames) = self.hotcell_sample_frames {
                            step.max_frames = frames.max(1);
                        }
                        if let Some(thresh) = self.hotcell_thresh {
                            *fraction = thresh;
                        }
                    }
                    PrecalStepKind::Weighting { .. } => {
                        if let Some(frames) = self.weighting_sample_frames {
                            step.max_frames = frames.max(1);
                        }
                    }
                }
                step
            })
            .collect()
    }
}

fn or_default<T: FromStr>(entry: Option<(String, String)>, default: T) -> T {
    optional(entry).unwrap_or(default)
}

fn optional<T: FromStr>(entry: Option<(String, String)>) -> Option<T> {
    let (key, raw) = entry?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("{}={:?} is not valid, using the default", key, raw);
            None
        }
    }
}
