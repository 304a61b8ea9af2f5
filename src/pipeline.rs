// THEORY:
// The `pipeline` module is the top-level API of the trigger. `DaqPipeline`
// builds every service exactly once and wires them together, so nothing in the
// crate is a global: the worker pool, calibrators, block manager and state
// machine all live here and are reached through it.
//
// The camera side talks to it in three calls: lease a sensor slot, prepare a
// frame on it, submit the frame. The application side steers it with
// `begin`/`pause`/`resume`, feeds it `RemoteCommand`s, and reads `status()`.

use crate::collaborators::{DeviceStatus, ExportSink};
use crate::config::{DaqConfig, SharedConfig};
use crate::core_modules::acquisition_block::{BlockSnapshot, CandidateEvent};
use crate::core_modules::block_manager::{AcquisitionBlockManager, PassRateMonitor};
use crate::core_modules::calibrator::{ThresholdCalibrator, Thresholds};
use crate::core_modules::frame::{
    ClaimBudget, FrameBuffer, FrameBuilder, SensorBufferPool, SlotLease, monotonic_nanos,
};
use crate::core_modules::precalibration::{PreCalibrator, PrecalibrationResult};
use crate::core_modules::state_machine::{AcquisitionState, AcquisitionStateMachine};
use crate::core_modules::trigger_config::TriggerConfig;
use crate::error::DaqError;
use crate::parallel_pipeline::{StageContext, WorkerPool};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A configuration change pushed by the server. Field names follow the
/// server's keys; anything absent is left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCommand {
    #[serde(rename = "set_L1_thresh")]
    pub l1_threshold: Option<f64>,
    #[serde(rename = "set_L2_thresh")]
    pub l2_threshold: Option<u8>,
    #[serde(rename = "set_L0_trig")]
    pub l0_trigger: Option<String>,
    #[serde(rename = "set_L1_trig")]
    pub l1_trigger: Option<String>,
    #[serde(rename = "set_L2_trig")]
    pub l2_trigger: Option<String>,
    #[serde(rename = "set_trigger_lock")]
    pub trigger_lock: Option<bool>,
    #[serde(rename = "set_target_L2_rate")]
    pub target_events_per_minute: Option<f64>,
    pub calibration_sample_frames: Option<u64>,
    pub stabilization_sample_frames: Option<u64>,
    pub weighting_sample_frames: Option<u64>,
    pub hotcell_sample_frames: Option<u64>,
    pub hotcell_thresh: Option<f64>,
    /// Block period in seconds.
    #[serde(rename = "set_xb_period")]
    pub block_period: Option<u64>,
    #[serde(rename = "set_qual_bg_avg")]
    pub quality_background_mean: Option<f64>,
    #[serde(rename = "set_qual_bg_var")]
    pub quality_background_std: Option<f64>,
    /// Maximum tilt from flat, in degrees.
    #[serde(rename = "set_qual_orientation")]
    pub quality_orientation: Option<f64>,
    #[serde(rename = "cmd_recalibrate")]
    pub recalibrate: Option<bool>,
}

/// Read-only view for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub run_id: u64,
    pub state: AcquisitionState,
    pub recalibrating: bool,
    pub current_block: BlockSnapshot,
    pub thresholds: Thresholds,
    pub calibration_samples: usize,
    pub fps: f64,
    pub calibrator_histogram: Vec<i64>,
    pub pending_blocks: usize,
    pub precalibrated: bool,
    pub recent_events: Vec<CandidateEvent>,
}

pub struct DaqPipeline {
    config: SharedConfig,
    pool: Arc<WorkerPool>,
    calibrator: Arc<ThresholdCalibrator>,
    precalibrator: Arc<PreCalibrator>,
    state_machine: Arc<AcquisitionStateMachine>,
    manager: Arc<AcquisitionBlockManager>,
    sensor_pool: Arc<SensorBufferPool>,
    claim_budget: Arc<ClaimBudget>,
    weighting: Mutex<Option<Arc<PrecalibrationResult>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DaqPipeline {
    /// Builds every service. Must be called inside a tokio runtime.
    pub fn new(
        config: DaqConfig,
        export: Arc<dyn ExportSink>,
        device: Arc<dyn DeviceStatus>,
    ) -> Arc<Self> {
        let calibrator = Arc::new(ThresholdCalibrator::new(
            config.calibrator_window,
            config.l2_min_threshold,
            config.l1_config().initial_threshold,
        ));
        let precalibrator = Arc::new(PreCalibrator::new(config.precal_steps()));
        let pass_monitor = Arc::new(PassRateMonitor::new(config.pass_rate_window));
        let pool = Arc::new(WorkerPool::new(config.worker_threads));
        let sensor_pool = Arc::new(SensorBufferPool::new(
            config.sensor_slots,
            config.sensor_width,
            config.sensor_height,
        ));
        let claim_budget = ClaimBudget::new(config.claim_budget_bytes);
        let run_id: u64 = rand::rng().random();
        let workers = config.worker_threads;
        let config = Arc::new(RwLock::new(config));

        let state_machine = Arc::new_cyclic(|weak| {
            let ctx = StageContext {
                pool: pool.clone(),
                calibrator: calibrator.clone(),
                precalibrator: precalibrator.clone(),
                pass_monitor,
                state_machine: weak.clone(),
            };
            let manager = Arc::new(AcquisitionBlockManager::new(
                config.clone(),
                ctx,
                export.clone(),
                device,
                run_id,
            ));
            AcquisitionStateMachine::new(
                manager,
                calibrator.clone(),
                precalibrator.clone(),
                export,
                config.clone(),
            )
        });
        log::info!("run {:016x} ready with {} trigger workers", run_id, workers);

        Arc::new(Self {
            manager: state_machine.manager().clone(),
            config,
            pool,
            calibrator,
            precalibrator,
            state_machine,
            sensor_pool,
            claim_budget,
            weighting: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the periodic export flush and pass-rate check.
    pub fn start(self: &Arc<Self>) {
        let period = self.config.read().flush_interval.max(Duration::from_millis(1));
        let pipeline = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(pipeline) = pipeline.upgrade() else {
                    break;
                };
                pipeline.manager.flush_committed_blocks();
                pipeline.manager.check_pass_rate();
            }
        });
        self.background.lock().push(handle);
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn state(&self) -> AcquisitionState {
        self.state_machine.state()
    }

    pub fn state_machine(&self) -> &Arc<AcquisitionStateMachine> {
        &self.state_machine
    }

    pub fn sensor_pool(&self) -> &Arc<SensorBufferPool> {
        &self.sensor_pool
    }

    pub fn calibrator(&self) -> &Arc<ThresholdCalibrator> {
        &self.calibrator
    }

    /// Leaves INIT and starts surveying the sensor.
    pub fn begin(&self) -> Result<(), DaqError> {
        self.state_machine.transition(AcquisitionState::Survey)?;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), DaqError> {
        self.state_machine.transition(AcquisitionState::Idle)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), DaqError> {
        self.state_machine.transition(AcquisitionState::Survey)?;
        Ok(())
    }

    /// A frame builder for `lease` with the claim budget attached and, once
    /// precalibration has finished, its pixel weighting.
    pub fn prepare_frame(&self, lease: SlotLease) -> FrameBuilder {
        let builder = FrameBuffer::builder(lease).claim_budget(self.claim_budget.clone());
        let mut weighting = self.weighting.lock();
        if !self.precalibrator.is_complete() {
            *weighting = None;
            return builder;
        }
        if weighting.is_none() {
            *weighting = self.precalibrator.result().map(Arc::new);
        }
        match weighting.as_ref() {
            Some(result) => builder.weighting(result.clone()),
            None => builder,
        }
    }

    /// Hands a frame to the current block.
    pub fn submit_frame(&self, frame: FrameBuffer) -> Result<(), DaqError> {
        match self.manager.assign_frame(Arc::new(frame)) {
            Ok(_) => Ok(()),
            Err(err) => {
                log::error!("frame rejected: {}", err);
                Err(err)
            }
        }
    }

    pub fn apply_command(&self, command: RemoteCommand) -> Result<(), DaqError> {
        let prior = self.state_machine.state();
        let reconfigure = matches!(prior, AcquisitionState::Data | AcquisitionState::Idle);
        if reconfigure {
            self.state_machine.transition(AcquisitionState::Reconfigure)?;
        }

        self.update_config(&command);

        if reconfigure {
            let next = if prior == AcquisitionState::Data {
                AcquisitionState::Stabilization
            } else {
                AcquisitionState::Idle
            };
            self.state_machine.transition(next)?;
        } else if command.recalibrate == Some(true) && prior.is_recalibrating() {
            self.state_machine.transition(AcquisitionState::Stabilization)?;
        }
        Ok(())
    }

    fn update_config(&self, command: &RemoteCommand) {
        let mut reset_l1 = None;
        let mut resize_window = None;
        {
            let mut config = self.config.write();
            if let Some(trigger) = &command.l0_trigger {
                config.l0_trigger = trigger.clone();
            }
            if let Some(trigger) = &command.l1_trigger {
                config.l1_trigger = trigger.clone();
                if TriggerConfig::parse(trigger).get_str("thresh").is_some() {
                    reset_l1 = Some(config.l1_config().initial_threshold);
                }
            }
            if let Some(trigger) = &command.l2_trigger {
                config.l2_trigger = trigger.clone();
            }
            if let Some(lock) = command.trigger_lock {
                config.trigger_lock = lock;
            }
            if let Some(rate) = command.target_events_per_minute {
                config.target_events_per_minute = rate.max(0.0);
            }
            if let Some(frames) = command.calibration_sample_frames {
                config.calibration_sample_frames = frames.max(1);
                config.calibrator_window = frames.max(1) as usize;
                resize_window = Some(config.calibrator_window);
            }
            if let Some(frames) = command.stabilization_sample_frames {
                config.stabilization_sample_frames = frames.max(1);
            }
            if let Some(frames) = command.weighting_sample_frames {
                config.weighting_sample_frames = Some(frames);
            }
            if let Some(frames) = command.hotcell_sample_frames {
                config.hotcell_sample_frames = Some(frames);
            }
            if let Some(thresh) = command.hotcell_thresh {
                config.hotcell_thresh = Some(thresh.clamp(0.0, 1.0));
            }
            if let Some(secs) = command.block_period {
                config.block_period = Duration::from_secs(secs.max(1));
            }

            let mut quality = TriggerConfig::parse(&config.quality_trigger);
            let mut quality_changed = false;
            if let Some(degrees) = command.quality_orientation {
                quality = quality.with_option("orient", degrees);
                quality_changed = true;
            }
            if let Some(mean) = command.quality_background_mean {
                quality = quality.with_option("mean", mean);
                quality_changed = true;
            }
            if let Some(std_dev) = command.quality_background_std {
                quality = quality.with_option("std", std_dev);
                quality_changed = true;
            }
            if quality_changed {
                config.quality_trigger = quality.to_string();
            }
        }

        if let Some(window) = resize_window {
            self.calibrator.resize(window);
        }
        if let Some(l1) = command.l1_threshold.or(reset_l1) {
            self.calibrator.set_l1_threshold(l1);
        }
        if let Some(l2) = command.l2_threshold {
            self.calibrator.set_l2_threshold(l2);
        }
        log::info!("remote command applied: {:?}", command);
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.state_machine.state();
        PipelineStatus {
            run_id: self.manager.run_id(),
            state,
            recalibrating: state.is_recalibrating(),
            current_block: self.manager.peek_block().snapshot(),
            thresholds: self.calibrator.thresholds(),
            calibration_samples: self.calibrator.sample_count(),
            fps: self.calibrator.fps(),
            calibrator_histogram: self.calibrator.histogram().values().to_vec(),
            pending_blocks: self.manager.pending_blocks(),
            precalibrated: self.precalibrator.is_complete(),
            recent_events: self.manager.recent_events().snapshot(),
        }
    }

    /// Resolves once every submitted frame has finished its chain.
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }

    /// Runs one export sweep now.
    pub fn flush(&self) -> usize {
        self.manager.flush_committed_blocks()
    }

    /// Exports every pending block regardless of the grace period.
    pub fn flush_all(&self) -> usize {
        let stale = self.config.read().stale_timeout.as_nanos() as u64;
        self.manager
            .flush_committed_blocks_at(monotonic_nanos().saturating_add(stale))
    }

    /// Stops the background loop and drains the worker pool.
    pub async fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.pool.shutdown().await;
        log::info!("run {:016x} shut down", self.manager.run_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_command_uses_server_keys() {
        let command: RemoteCommand = serde_json::from_str(
            r#"{"set_L1_thresh": 12, "set_target_L2_rate": 5.5, "set_qual_orientation": 20,
                "cmd_recalibrate": true, "nickname": "ignored"}"#,
        )
        .unwrap();
        assert_eq!(command.l1_threshold, Some(12.0));
        assert_eq!(command.target_events_per_minute, Some(5.5));
        assert_eq!(command.quality_orientation, Some(20.0));
        assert_eq!(command.recalibrate, Some(true));
        assert_eq!(command.l2_trigger, None);
    }
}
