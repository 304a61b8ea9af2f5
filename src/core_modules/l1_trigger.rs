// THEORY:
// L1 is the coarse whole-frame trigger. It is cheap: it only looks at the cached
// peak intensity. What it does with a frame depends on the phase of the block
// the frame belongs to:
//
// * CALIBRATION: the peak is a calibration sample. Nothing is triggered.
// * STABILIZATION: the frame is skipped while the sensor settles.
// * DATA: the peak is still a calibration sample, and the frame passes when
//   its peak exceeds the block's L1 threshold. A passing frame is claimed here,
//   before it is handed to the expensive L2 reconstruction.
//
// The threshold comes from the block, never from the calibrator's live value,
// so a recalibration halfway through a block cannot change what the frames
// already in flight are held to.

use crate::core_modules::acquisition_block::AcquisitionBlock;
use crate::core_modules::frame::FrameBuffer;
use crate::core_modules::state_machine::AcquisitionState;
use crate::core_modules::trigger_config::TriggerConfig;
use crate::parallel_pipeline::{StageContext, TaskOutcome};
use rand::Rng;

pub const DEFAULT_THRESHOLD: f64 = 255.0;

#[derive(Debug, Clone, PartialEq)]
pub struct L1Config {
    /// Threshold used until the first calibration completes.
    pub initial_threshold: f64,
    /// Allow fractional thresholds out of the calibrator.
    pub prescale: bool,
}

impl L1Config {
    pub fn from_trigger(config: &TriggerConfig) -> Self {
        Self {
            initial_threshold: config.get_f64("thresh", DEFAULT_THRESHOLD).clamp(0.0, 255.0),
            prescale: config.get_bool("prescale", true),
        }
    }
}

/// Whether `peak` passes `threshold`. Peaks above `floor(threshold) + 1` always
/// pass. A peak of exactly `floor(threshold) + 1` passes when `draw` (uniform in
/// [0, 1)) is at least the fractional part, so an integer threshold reduces to
/// `peak > threshold`.
pub fn passes_threshold(threshold: f64, peak: u8, draw: f64) -> bool {
    let base = threshold.floor();
    let fraction = threshold - base;
    let peak = peak as f64;
    if peak > base + 1.0 {
        true
    } else if peak == base + 1.0 {
        draw >= fraction
    } else {
        false
    }
}

pub fn process_frame(
    frame: &FrameBuffer,
    block: &AcquisitionBlock,
    ctx: &StageContext,
) -> TaskOutcome {
    let stats = match frame.statistics() {
        Ok(stats) => stats,
        Err(err) => {
            log::warn!("L1 dropping frame: {}", err);
            return TaskOutcome::Drop;
        }
    };
    let acquired = frame.metadata().acquired.nanos;

    match block.state() {
        AcquisitionState::Calibration | AcquisitionState::Stabilization => {
            ctx.calibrator.add_frame(stats.peak, acquired);
            TaskOutcome::Consume
        }
        AcquisitionState::Data => {
            ctx.calibrator.add_frame(stats.peak, acquired);
            block.fill_pixel_histogram(&stats.histogram);

            let draw = rand::rng().random::<f64>();
            if !passes_threshold(block.l1_threshold(), stats.peak, draw) {
                return TaskOutcome::Reject;
            }
            match frame.claim() {
                Ok(()) => TaskOutcome::Forward { pass: 1 },
                Err(err) => {
                    log::warn!("L1 pass dropped under memory pressure: {}", err);
                    TaskOutcome::Drop
                }
            }
        }
        other => {
            log::warn!("L1 received a frame from a {:?} block", other);
            TaskOutcome::Reject
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_threshold_is_strict() {
        assert!(!passes_threshold(200.0, 200, 0.0));
        assert!(passes_threshold(200.0, 201, 0.0));
        assert!(passes_threshold(200.0, 201, 0.999));
    }

    #[test]
    fn fractional_threshold_accepts_boundary_with_probability() {
        // 199.75: peaks of 201+ always pass, 200 passes for draws >= 0.75.
        assert!(passes_threshold(199.75, 201, 0.0));
        assert!(!passes_threshold(199.75, 200, 0.5));
        assert!(passes_threshold(199.75, 200, 0.8));
        assert!(!passes_threshold(199.75, 199, 0.99));
    }

    #[test]
    fn config_defaults() {
        let config = L1Config::from_trigger(&TriggerConfig::parse("default"));
        assert_eq!(config.initial_threshold, 255.0);
        assert!(config.prescale);
        let config = L1Config::from_trigger(&TriggerConfig::parse("default;thresh=40;prescale=false"));
        assert_eq!(config.initial_threshold, 40.0);
        assert!(!config.prescale);
    }
}
