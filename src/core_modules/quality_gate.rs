// THEORY:
// The quality gate decides whether a frame was taken under conditions the
// calibration still describes. A device that was picked up, flipped, or
// uncovered produces frames whose background no longer matches the threshold,
// so such frames are dropped before L1 ever looks at them and the acquisition
// falls back to stabilization.
//
// Three policies exist, selected by the config name:
// * `facedown`: the device lies flat, and screen-down exactly when the back
//   camera is in use, and the background is dark and quiet.
// * `autodetect`: only the background cuts.
// * `lock`: only the camera facing.

use crate::core_modules::acquisition_block::AcquisitionBlock;
use crate::core_modules::frame::{FrameBuffer, FrameMetadata, FrameStatistics};
use crate::core_modules::trigger_config::TriggerConfig;
use crate::parallel_pipeline::{StageContext, TaskOutcome};

pub const DEFAULT_ORIENTATION_DEGREES: f64 = 10.0;
pub const DEFAULT_MAX_MEAN: f64 = 10.0;
pub const DEFAULT_MAX_STD: f64 = 255.0;

#[derive(Debug, Clone, PartialEq)]
pub enum QualityPolicy {
    FaceDown {
        /// Minimum |cos| between the device z-axis and gravity.
        orientation_cos: f64,
        max_mean: f64,
        max_std: f64,
    },
    AutoDetect {
        max_mean: f64,
        max_std: f64,
    },
    Lock {
        facing_back: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QualityFailure {
    Orientation { rotation_zz: f32 },
    Facing,
    Background { mean: f64, std_dev: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityConfig {
    pub policy: QualityPolicy,
}

impl QualityConfig {
    pub fn from_trigger(config: &TriggerConfig) -> Self {
        let max_mean = config.get_f64("mean", DEFAULT_MAX_MEAN);
        let max_std = config.get_f64("std", DEFAULT_MAX_STD);
        let policy = match config.name() {
            "autodetect" => QualityPolicy::AutoDetect { max_mean, max_std },
            "lock" => QualityPolicy::Lock {
                facing_back: config.get_bool("back", true),
            },
            name => {
                if name != "facedown" {
                    log::warn!("unknown quality policy '{}', using facedown", name);
                }
                let degrees = config.get_f64("orient", DEFAULT_ORIENTATION_DEGREES);
                QualityPolicy::FaceDown {
                    orientation_cos: degrees.to_radians().cos(),
                    max_mean,
                    max_std,
                }
            }
        };
        Self { policy }
    }

    pub fn evaluate(
        &self,
        metadata: &FrameMetadata,
        stats: &FrameStatistics,
    ) -> Result<(), QualityFailure> {
        match self.policy {
            QualityPolicy::FaceDown {
                orientation_cos,
                max_mean,
                max_std,
            } => {
                if let Some(rotation_zz) = metadata.rotation_zz {
                    if (rotation_zz.abs() as f64) < orientation_cos {
                        return Err(QualityFailure::Orientation { rotation_zz });
                    }
                    if metadata.facing_back != (rotation_zz > 0.0) {
                        return Err(QualityFailure::Facing);
                    }
                }
                check_background(stats, max_mean, max_std)
            }
            QualityPolicy::AutoDetect { max_mean, max_std } => {
                check_background(stats, max_mean, max_std)
            }
            QualityPolicy::Lock { facing_back } => {
                if metadata.facing_back == facing_back {
                    Ok(())
                } else {
                    Err(QualityFailure::Facing)
                }
            }
        }
    }
}

pub fn process_frame(
    config: &QualityConfig,
    frame: &FrameBuffer,
    block: &AcquisitionBlock,
    ctx: &StageContext,
) -> TaskOutcome {
    let stats = match frame.statistics() {
        Ok(stats) => stats,
        Err(err) => {
            log::warn!("quality gate dropping frame: {}", err);
            return TaskOutcome::Drop;
        }
    };
    match config.evaluate(frame.metadata(), stats) {
        Ok(()) => {
            ctx.report_quality(block, true);
            TaskOutcome::Forward { pass: 1 }
        }
        Err(failure) => {
            log::debug!("frame {} failed quality: {:?}", frame.id(), failure);
            ctx.report_quality(block, false);
            TaskOutcome::Reject
        }
    }
}

fn check_background(stats: &FrameStatistics, max_mean: f64, max_std: f64) -> Result<(), QualityFailure> {
    if stats.mean > max_mean || stats.std_dev > max_std {
        Err(QualityFailure::Background {
            mean: stats.mean,
            std_dev: stats.std_dev,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(mean: f64, std_dev: f64) -> FrameStatistics {
        FrameStatistics {
            peak: 0,
            mean,
            std_dev,
            histogram: vec![0; 256],
        }
    }

    fn flat(rotation_zz: f32, facing_back: bool) -> FrameMetadata {
        FrameMetadata {
            rotation_zz: Some(rotation_zz),
            facing_back,
            ..FrameMetadata::default()
        }
    }

    #[test]
    fn facedown_checks_orientation_then_background() {
        let gate = QualityConfig::from_trigger(&TriggerConfig::parse("facedown;orient=10;mean=8"));

        assert_eq!(gate.evaluate(&flat(0.999, true), &stats(2.0, 1.0)), Ok(()));
        assert!(matches!(
            gate.evaluate(&flat(0.9, true), &stats(2.0, 1.0)),
            Err(QualityFailure::Orientation { .. })
        ));
        assert_eq!(
            gate.evaluate(&flat(-0.999, true), &stats(2.0, 1.0)),
            Err(QualityFailure::Facing)
        );
        assert!(matches!(
            gate.evaluate(&flat(0.999, true), &stats(9.0, 1.0)),
            Err(QualityFailure::Background { .. })
        ));
    }

    #[test]
    fn missing_orientation_only_checks_background() {
        let gate = QualityConfig::from_trigger(&TriggerConfig::parse("facedown"));
        assert_eq!(gate.evaluate(&FrameMetadata::default(), &stats(5.0, 3.0)), Ok(()));
    }

    #[test]
    fn lock_only_cares_about_facing() {
        let gate = QualityConfig::from_trigger(&TriggerConfig::parse("lock;back=false"));
        assert_eq!(gate.evaluate(&flat(0.0, false), &stats(200.0, 90.0)), Ok(()));
        assert_eq!(gate.evaluate(&flat(0.0, true), &stats(0.0, 0.0)), Err(QualityFailure::Facing));
    }

    #[test]
    fn autodetect_applies_std_cut() {
        let gate = QualityConfig::from_trigger(&TriggerConfig::parse("autodetect;std=4"));
        assert_eq!(gate.evaluate(&FrameMetadata::default(), &stats(1.0, 3.9)), Ok(()));
        assert!(gate.evaluate(&FrameMetadata::default(), &stats(1.0, 4.1)).is_err());
    }
}
