// THEORY:
// L0 is the zero-bias sampler. It never rejects anything: every frame is
// forwarded to the quality gate and L1. A prescaled fraction of frames is
// additionally tagged with a small square of raw weighted pixels copied from a
// random position. Those squares are kept no matter what L1 decides later,
// which gives an unbiased picture of the sensor noise that the triggered events
// can be compared against.

use crate::core_modules::frame::FrameBuffer;
use crate::core_modules::trigger_config::TriggerConfig;
use crate::parallel_pipeline::TaskOutcome;
use image::GrayImage;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRESCALE: f64 = 0.001;
pub const DEFAULT_WINDOW_SIZE: u64 = 10;

/// A square of unconditioned pixel values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroBiasSquare {
    pub x: u32,
    pub y: u32,
    pub size: u32,
    /// Row-major pixel values.
    pub values: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct L0Config {
    /// Fraction of frames sampled.
    pub prescale: f64,
    /// Random sampling when true, otherwise every `1/prescale`-th frame.
    pub random: bool,
    pub window_size: u32,
}

impl L0Config {
    pub fn from_trigger(config: &TriggerConfig) -> Self {
        Self {
            prescale: config.get_f64("prescale", DEFAULT_PRESCALE).clamp(0.0, 1.0),
            random: config.get_bool("random", true),
            window_size: config.get_u64("windowsize", DEFAULT_WINDOW_SIZE).max(1) as u32,
        }
    }

    /// Whether the `sequence`-th frame seen by this stage is sampled.
    pub fn should_sample(&self, sequence: u64, rng: &mut impl Rng) -> bool {
        if self.prescale <= 0.0 {
            return false;
        }
        if self.random {
            rng.random::<f64>() < self.prescale
        } else {
            let period = (1.0 / self.prescale).round().max(1.0) as u64;
            sequence % period == 0
        }
    }

    /// Copies a `window_size` square from a random position, or `None` if the
    /// plane is smaller than the window.
    pub fn sample_window(&self, plane: &GrayImage, rng: &mut impl Rng) -> Option<ZeroBiasSquare> {
        let size = self.window_size;
        let (width, height) = plane.dimensions();
        if size > width || size > height {
            return None;
        }
        let x = rng.random_range(0..=width - size);
        let y = rng.random_range(0..=height - size);
        let mut values = Vec::with_capacity((size * size) as usize);
        for row in y..y + size {
            for col in x..x + size {
                values.push(plane.get_pixel(col, row).0[0]);
            }
        }
        Some(ZeroBiasSquare { x, y, size, values })
    }
}

pub fn process_frame(config: &L0Config, frame: &FrameBuffer, sequence: u64) -> TaskOutcome {
    let mut rng = rand::rng();
    if !config.should_sample(sequence, &mut rng) {
        return TaskOutcome::Forward { pass: 0 };
    }
    match frame.with_plane(|plane| config.sample_window(plane, &mut rng)) {
        Ok(Some(square)) => {
            frame.set_zero_bias(square);
            TaskOutcome::Forward { pass: 1 }
        }
        Ok(None) => {
            log::warn!(
                "zero-bias window {} does not fit a {}x{} frame",
                config.window_size,
                frame.width(),
                frame.height()
            );
            TaskOutcome::Forward { pass: 0 }
        }
        Err(err) => {
            log::warn!("zero-bias sample skipped: {}", err);
            TaskOutcome::Forward { pass: 0 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::SensorBufferPool;

    #[test]
    fn defaults_follow_documented_values() {
        let config = L0Config::from_trigger(&TriggerConfig::parse("default;prescale=oops"));
        assert_eq!(config.prescale, DEFAULT_PRESCALE);
        assert!(config.random);
        assert_eq!(config.window_size, 10);
    }

    #[test]
    fn deterministic_mode_samples_every_nth_frame() {
        let config = L0Config::from_trigger(&TriggerConfig::parse("default;prescale=0.25;random=false"));
        let mut rng = rand::rng();
        let picked: Vec<u64> = (0..12).filter(|&s| config.should_sample(s, &mut rng)).collect();
        assert_eq!(picked, vec![0, 4, 8]);
    }

    #[test]
    fn zero_prescale_never_samples() {
        let config = L0Config::from_trigger(&TriggerConfig::parse("default;prescale=0"));
        let mut rng = rand::rng();
        assert!((0..1000).all(|s| !config.should_sample(s, &mut rng)));
    }

    #[test]
    fn sampled_frame_carries_a_square_and_is_forwarded() {
        let pool = SensorBufferPool::new(1, 12, 12);
        let lease = pool.try_acquire().unwrap();
        lease.write_raw(&[3u8; 144]);
        let frame = FrameBuffer::builder(lease).build();
        let config = L0Config::from_trigger(&TriggerConfig::parse("default;prescale=1;windowsize=4"));

        let outcome = process_frame(&config, &frame, 0);
        assert_eq!(outcome, TaskOutcome::Forward { pass: 1 });
        let square = frame.payload().zero_bias.expect("zero-bias square");
        assert_eq!(square.values, vec![3u8; 16]);
        assert!(square.x <= 8 && square.y <= 8);
        assert!(frame.payload().upload_requested);
    }
}
