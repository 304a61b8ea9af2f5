// THEORY:
// Before the trigger can be calibrated, the sensor itself has to be understood.
// Some pixels are "hot": they read high in frame after frame and would pass any
// threshold on their own. Others sit behind a brighter patch of the lens and
// read systematically higher than their neighbours. Precalibration runs a short
// list of steps, each over its own number of frames:
//
// * `hotcell`: track the highest and second-highest value every pixel ever
//   reads. A pixel whose *second* highest value is among the brightest on the
//   sensor cannot be explained by a single particle hit and is masked.
// * `weighting`: average each coarse cell of the sensor and derive a weight
//   that flattens brighter cells down to the global mean.
//
// The outcome is a `PrecalibrationResult` that is exported and can be handed
// back to the camera as its `PixelWeighting`.

use crate::core_modules::frame::{AcquisitionTime, FrameBuffer, INTENSITY_LEVELS, PixelWeighting};
use crate::core_modules::histogram::Histogram;
use crate::core_modules::trigger_config::TriggerConfig;
use crate::parallel_pipeline::{StageContext, TaskOutcome};
use image::GrayImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOTCELL_FRAMES: u64 = 1000;
pub const DEFAULT_HOTCELL_FRACTION: f64 = 0.0002;
pub const DEFAULT_WEIGHTING_FRAMES: u64 = 500;
pub const DEFAULT_DOWNSAMPLE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrecalStepKind {
    /// Mask at most `fraction` of the sensor as hot.
    HotCell { fraction: f64 },
    /// Flatten `downsample`-sized cells.
    Weighting { downsample: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecalStep {
    pub kind: PrecalStepKind,
    pub max_frames: u64,
}

impl PrecalStep {
    pub fn from_trigger(config: &TriggerConfig) -> Option<Self> {
        match config.name() {
            "hotcell" => Some(Self {
                kind: PrecalStepKind::HotCell {
                    fraction: config.get_f64("thresh", DEFAULT_HOTCELL_FRACTION),
                },
                max_frames: config.get_u64("maxframes", DEFAULT_HOTCELL_FRAMES).max(1),
            }),
            "weighting" => Some(Self {
                kind: PrecalStepKind::Weighting {
                    downsample: config.get_u64("downsample", DEFAULT_DOWNSAMPLE).max(1) as u32,
                },
                max_frames: config.get_u64("maxframes", DEFAULT_WEIGHTING_FRAMES).max(1),
            }),
            other => {
                log::warn!("ignoring unknown precalibration step '{}'", other);
                None
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            PrecalStepKind::HotCell { .. } => "hotcell",
            PrecalStepKind::Weighting { .. } => "weighting",
        }
    }
}

/// Parses `hotcell;maxframes=1000 -> weighting;maxframes=500`.
pub fn parse_steps(raw: &str) -> Vec<PrecalStep> {
    TriggerConfig::parse_list(raw)
        .iter()
        .filter_map(PrecalStep::from_trigger)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightGrid {
    pub downsample: u32,
    pub cols: u32,
    pub rows: u32,
    /// Row-major cell weights in (0, 1].
    pub weights: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecalibrationResult {
    pub width: u32,
    pub height: u32,
    pub hot_cells: Vec<(u32, u32)>,
    /// Distribution of every pixel's second-highest reading.
    pub second_max_histogram: Vec<i64>,
    pub weights: Option<WeightGrid>,
    pub completed: Option<AcquisitionTime>,
}

impl PixelWeighting for PrecalibrationResult {
    fn apply(&self, plane: &mut GrayImage) {
        if plane.dimensions() != (self.width, self.height) {
            return;
        }
        if let Some(grid) = &self.weights {
            for (x, y, pixel) in plane.enumerate_pixels_mut() {
                let cell = (y / grid.downsample) * grid.cols + x / grid.downsample;
                if let Some(weight) = grid.weights.get(cell as usize) {
                    pixel.0[0] = (pixel.0[0] as f32 * weight).round().min(255.0) as u8;
                }
            }
        }
        for &(x, y) in &self.hot_cells {
            plane.put_pixel(x, y, image::Luma([0]));
        }
    }
}

enum Accumulator {
    Empty,
    HotCell {
        width: u32,
        height: u32,
        max: Vec<u8>,
        second: Vec<u8>,
    },
    Weighting {
        width: u32,
        height: u32,
        downsample: u32,
        cols: u32,
        rows: u32,
        sums: Vec<u64>,
        counts: Vec<u64>,
    },
}

struct PrecalInner {
    steps: Vec<PrecalStep>,
    current: usize,
    accumulator: Accumulator,
    result: PrecalibrationResult,
}

pub enum StepProgress {
    Next(PrecalStep),
    Complete(PrecalibrationResult),
}

pub struct PreCalibrator {
    inner: Mutex<PrecalInner>,
}

impl PreCalibrator {
    pub fn new(steps: Vec<PrecalStep>) -> Self {
        Self {
            inner: Mutex::new(PrecalInner {
                steps,
                current: 0,
                accumulator: Accumulator::Empty,
                result: PrecalibrationResult::default(),
            }),
        }
    }

    /// Replaces the step list and forgets all progress.
    pub fn configure(&self, steps: Vec<PrecalStep>) {
        let mut inner = self.inner.lock();
        inner.steps = steps;
        inner.current = 0;
        inner.accumulator = Accumulator::Empty;
        inner.result = PrecalibrationResult::default();
    }

    /// Discards whatever the current step has accumulated so far.
    pub fn restart_step(&self) {
        self.inner.lock().accumulator = Accumulator::Empty;
    }

    pub fn current_step(&self) -> Option<PrecalStep> {
        let inner = self.inner.lock();
        inner.steps.get(inner.current).copied()
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.current >= inner.steps.len()
    }

    pub fn result(&self) -> Option<PrecalibrationResult> {
        let inner = self.inner.lock();
        (inner.current >= inner.steps.len() && !inner.steps.is_empty()).then(|| inner.result.clone())
    }

    pub fn add_frame(&self, plane: &GrayImage) {
        let mut inner = self.inner.lock();
        let Some(step) = inner.steps.get(inner.current).copied() else {
            return;
        };
        let (width, height) = plane.dimensions();
        let fits = match &inner.accumulator {
            Accumulator::HotCell { width: w, height: h, .. }
            | Accumulator::Weighting { width: w, height: h, .. } => (*w, *h) == (width, height),
            Accumulator::Empty => false,
        };
        if !fits {
            inner.accumulator = fresh_accumulator(step.kind, width, height);
        }

        match &mut inner.accumulator {
            Accumulator::HotCell { max, second, .. } => {
                for (i, &value) in plane.as_raw().iter().enumerate() {
                    if value > max[i] {
                        second[i] = max[i];
                        max[i] = value;
                    } else if value > second[i] {
                        second[i] = value;
                    }
                }
            }
            Accumulator::Weighting {
                downsample,
                cols,
                sums,
                counts,
                ..
            } => {
                for (x, y, pixel) in plane.enumerate_pixels() {
                    let cell = ((y / *downsample) * *cols + x / *downsample) as usize;
                    sums[cell] += pixel.0[0] as u64;
                    counts[cell] += 1;
                }
            }
            Accumulator::Empty => {}
        }
    }

    /// Closes the current step. `None` if every step already finished.
    pub fn finish_step(&self) -> Option<StepProgress> {
        let mut inner = self.inner.lock();
        let step = inner.steps.get(inner.current).copied()?;
        let accumulator = std::mem::replace(&mut inner.accumulator, Accumulator::Empty);

        match (step.kind, accumulator) {
            (
                PrecalStepKind::HotCell { fraction },
                Accumulator::HotCell {
                    width,
                    height,
                    second,
                    ..
                },
            ) => {
                let mut histogram = Histogram::new(INTENSITY_LEVELS);
                second.iter().for_each(|&v| histogram.fill(v as i64));
                let budget = fraction * second.len() as f64;
                let (cutoff, _) = histogram.tail_threshold(budget);
                inner.result.hot_cells = second
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v as i64 > cutoff)
                    .map(|(i, _)| (i as u32 % width, i as u32 / width))
                    .collect();
                inner.result.second_max_histogram = histogram.values().to_vec();
                inner.result.width = width;
                inner.result.height = height;
                log::info!(
                    "hot cell scan done: {} of {} pixels masked (second max > {})",
                    inner.result.hot_cells.len(),
                    second.len(),
                    cutoff
                );
            }
            (
                PrecalStepKind::Weighting { .. },
                Accumulator::Weighting {
                    width,
                    height,
                    downsample,
                    cols,
                    rows,
                    sums,
                    counts,
                },
            ) => {
                let means: Vec<f64> = sums
                    .iter()
                    .zip(&counts)
                    .map(|(&s, &c)| if c == 0 { 0.0 } else { s as f64 / c as f64 })
                    .collect();
                let global = means.iter().sum::<f64>() / means.len().max(1) as f64;
                let weights = means
                    .iter()
                    .map(|&m| if m > 0.0 { (global / m).min(1.0) as f32 } else { 1.0 })
                    .collect();
                inner.result.weights = Some(WeightGrid {
                    downsample,
                    cols,
                    rows,
                    weights,
                });
                inner.result.width = width;
                inner.result.height = height;
                log::info!("weighting map done: {}x{} cells", cols, rows);
            }
            (kind, _) => {
                log::warn!("precalibration step {:?} finished without any frames", kind);
            }
        }

        inner.current += 1;
        match inner.steps.get(inner.current).copied() {
            Some(next) => Some(StepProgress::Next(next)),
            None => {
                inner.result.completed = Some(AcquisitionTime::now(0));
                Some(StepProgress::Complete(inner.result.clone()))
            }
        }
    }
}

fn fresh_accumulator(kind: PrecalStepKind, width: u32, height: u32) -> Accumulator {
    let area = (width * height) as usize;
    match kind {
        PrecalStepKind::HotCell { .. } => Accumulator::HotCell {
            width,
            height,
            max: vec![0; area],
            second: vec![0; area],
        },
        PrecalStepKind::Weighting { downsample } => {
            let cols = width.div_ceil(downsample);
            let rows = height.div_ceil(downsample);
            Accumulator::Weighting {
                width,
                height,
                downsample,
                cols,
                rows,
                sums: vec![0; (cols * rows) as usize],
                counts: vec![0; (cols * rows) as usize],
            }
        }
    }
}

pub fn process_frame(frame: &FrameBuffer, ctx: &StageContext) -> TaskOutcome {
    match frame.with_plane(|plane| ctx.precalibrator.add_frame(plane)) {
        Ok(()) => TaskOutcome::Consume,
        Err(err) => {
            log::warn!("precalibration dropping frame: {}", err);
            TaskOutcome::Drop
        }
    }
}
