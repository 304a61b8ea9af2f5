// THEORY:
// The `AcquisitionStateMachine` decides which phase the whole device is in. The
// phase picks the trigger chain every new block runs, so a transition is
// always followed by a block rotation: no block ever mixes two phases.
//
//     INIT -> SURVEY -> PRECALIBRATION -> CALIBRATION -> DATA
//                 \          ^  \              ^  \        \
//                  \         |   v             |   v        v
//                   '---> STABILIZATION <------+---'   RECONFIGURE
//
// SURVEY checks that the device is lying still and dark. PRECALIBRATION maps
// hot pixels and lens shading, once per run. CALIBRATION fills the threshold
// window, and DATA triggers on it. STABILIZATION is the holding pattern after
// the sensor was disturbed; once it has seen enough quiet frames it returns to
// calibration. IDLE and RECONFIGURE take no frames at all.
//
// Key architectural principles:
// 1.  **Transitions are a table**: every edge is listed in `can_transition_to`.
//     Anything else is a `StateError::IllegalTransition`.
// 2.  **Requests name their block**: a stage that asks for a transition passes
//     the number of the block its frame belonged to. If that block is no
//     longer current the request is stale and ignored, so frames still in
//     flight from an old phase cannot drag the device back into it.
// 3.  **Lock order**: state, then the manager's current block, then the
//     calibrator. All side effects run under the state lock in that order.

use crate::collaborators::ExportSink;
use crate::config::SharedConfig;
use crate::core_modules::block_manager::AcquisitionBlockManager;
use crate::core_modules::calibrator::ThresholdCalibrator;
use crate::core_modules::precalibration::{PreCalibrator, StepProgress};
use crate::error::StateError;
use crate::parallel_pipeline::StageKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcquisitionState {
    Init,
    Survey,
    Precalibration,
    Calibration,
    Stabilization,
    Data,
    Idle,
    Reconfigure,
}

impl AcquisitionState {
    pub fn can_transition_to(self, to: AcquisitionState) -> bool {
        use AcquisitionState::*;
        match self {
            Init => matches!(to, Survey | Idle),
            Survey => matches!(to, Precalibration | Calibration | Stabilization | Idle),
            Precalibration => matches!(to, Precalibration | Calibration | Stabilization | Idle),
            Calibration => matches!(to, Data | Stabilization | Idle),
            Stabilization => matches!(to, Calibration | Precalibration | Stabilization | Idle),
            Data => matches!(to, Stabilization | Reconfigure | Idle),
            Idle => matches!(to, Survey | Reconfigure),
            Reconfigure => matches!(to, Stabilization | Idle),
        }
    }

    /// Phases in which the device is working towards DATA.
    pub fn is_recalibrating(self) -> bool {
        matches!(
            self,
            AcquisitionState::Survey
                | AcquisitionState::Precalibration
                | AcquisitionState::Calibration
                | AcquisitionState::Stabilization
        )
    }
}

pub struct AcquisitionStateMachine {
    state: Mutex<AcquisitionState>,
    manager: Arc<AcquisitionBlockManager>,
    calibrator: Arc<ThresholdCalibrator>,
    precalibrator: Arc<PreCalibrator>,
    export: Arc<dyn ExportSink>,
    config: SharedConfig,
    quality_failures: AtomicU32,
}

impl AcquisitionStateMachine {
    pub fn new(
        manager: Arc<AcquisitionBlockManager>,
        calibrator: Arc<ThresholdCalibrator>,
        precalibrator: Arc<PreCalibrator>,
        export: Arc<dyn ExportSink>,
        config: SharedConfig,
    ) -> Self {
        Self {
            state: Mutex::new(AcquisitionState::Init),
            manager,
            calibrator,
            precalibrator,
            export,
            config,
            quality_failures: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.lock()
    }

    pub fn manager(&self) -> &Arc<AcquisitionBlockManager> {
        &self.manager
    }

    /// Moves to `to` unconditionally. Returns the state it left.
    pub fn transition(&self, to: AcquisitionState) -> Result<AcquisitionState, StateError> {
        let mut state = self.state.lock();
        self.apply(&mut state, to)
    }

    /// Moves to `to` on behalf of block `xbn`. `Ok(None)` if that block is no
    /// longer current.
    pub fn request(
        &self,
        xbn: u64,
        to: AcquisitionState,
    ) -> Result<Option<AcquisitionState>, StateError> {
        let mut state = self.state.lock();
        if self.manager.current_xbn() != xbn {
            log::debug!("ignoring stale request for {:?} from block {}", to, xbn);
            return Ok(None);
        }
        self.apply(&mut state, to).map(Some)
    }

    /// Debounces quality failures. Enough of them in a row send the device to
    /// stabilization; a single pass starts the count over.
    pub fn report_quality(&self, xbn: u64, passed: bool) {
        if passed {
            self.quality_failures.store(0, Ordering::Release);
            return;
        }
        let debounce = self.config.read().quality_debounce_frames.max(1);
        let failures = self.quality_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < debounce {
            return;
        }
        log::warn!("{} consecutive quality failures in block {}", failures, xbn);
        if let Err(err) = self.request(xbn, AcquisitionState::Stabilization) {
            log::debug!("quality failure ignored: {}", err);
        }
    }

    /// A stage of block `xbn` has processed all the frames it was configured
    /// for.
    pub fn on_stage_complete(&self, kind: StageKind, xbn: u64, block_state: AcquisitionState) {
        let mut state = self.state.lock();
        if self.manager.current_xbn() != xbn {
            log::debug!("ignoring completion of {} from stale block {}", kind.name(), xbn);
            return;
        }

        let next = match (kind, block_state) {
            (StageKind::Quality, AcquisitionState::Survey)
            | (StageKind::L1, AcquisitionState::Stabilization) => {
                if self.precalibrator.is_complete() {
                    AcquisitionState::Calibration
                } else {
                    AcquisitionState::Precalibration
                }
            }
            (StageKind::PreCalibration, AcquisitionState::Precalibration) => {
                match self.precalibrator.finish_step() {
                    Some(StepProgress::Next(step)) => {
                        log::info!("precalibration continues with {}", step.name());
                        AcquisitionState::Precalibration
                    }
                    Some(StepProgress::Complete(result)) => {
                        log::info!("precalibration complete");
                        self.export.export_precalibration(result);
                        AcquisitionState::Calibration
                    }
                    None => AcquisitionState::Calibration,
                }
            }
            (StageKind::L1, AcquisitionState::Calibration) => AcquisitionState::Data,
            _ => return,
        };

        if let Err(err) = self.apply(&mut state, next) {
            log::error!("{}", err);
        }
    }

    fn apply(
        &self,
        state: &mut AcquisitionState,
        to: AcquisitionState,
    ) -> Result<AcquisitionState, StateError> {
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(StateError::IllegalTransition { from, to });
        }

        if to == AcquisitionState::Calibration {
            self.calibrator.clear();
        }
        match (from, to) {
            (AcquisitionState::Calibration, AcquisitionState::Data) => {
                let (target, prescale, trigger_lock) = {
                    let config = self.config.read();
                    (
                        config.target_events_per_minute,
                        config.l1_config().prescale,
                        config.trigger_lock,
                    )
                };
                self.calibrator
                    .update_thresholds(target, prescale, trigger_lock);
                self.export
                    .export_calibration(self.calibrator.summary(self.manager.run_id(), target));
            }
            (AcquisitionState::Survey, AcquisitionState::Precalibration) => {
                let steps = self.config.read().precal_steps();
                self.precalibrator.configure(steps);
            }
            (AcquisitionState::Stabilization, AcquisitionState::Precalibration) => {
                self.precalibrator.restart_step();
            }
            (from, AcquisitionState::Idle) if from != AcquisitionState::Data => {
                self.manager.abort_current();
            }
            _ => {}
        }

        *state = to;
        self.quality_failures.store(0, Ordering::Release);
        self.manager.new_block(to);
        log::info!("acquisition state {:?} -> {:?}", from, to);
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelExportSink, ExportRecord, StaticDeviceStatus};
    use crate::config::DaqConfig;
    use crate::core_modules::block_manager::PassRateMonitor;
    use crate::core_modules::precalibration::parse_steps;
    use crate::parallel_pipeline::{StageContext, WorkerPool};
    use parking_lot::RwLock;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn machine(config: DaqConfig) -> (Arc<AcquisitionStateMachine>, UnboundedReceiver<ExportRecord>) {
        let config = Arc::new(RwLock::new(config));
        let calibrator = Arc::new(ThresholdCalibrator::new(100, 2, 255.0));
        let precalibrator = Arc::new(PreCalibrator::new(config.read().precal_steps()));
        let (sink, records) = ChannelExportSink::new();
        let sink: Arc<dyn ExportSink> = Arc::new(sink);
        let pool = Arc::new(WorkerPool::new(1));

        let machine = Arc::new_cyclic(|weak| {
            let ctx = StageContext {
                pool,
                calibrator: calibrator.clone(),
                precalibrator: precalibrator.clone(),
                pass_monitor: Arc::new(PassRateMonitor::new(25)),
                state_machine: weak.clone(),
            };
            let manager = Arc::new(AcquisitionBlockManager::new(
                config.clone(),
                ctx,
                sink.clone(),
                Arc::new(StaticDeviceStatus::default()),
                1,
            ));
            AcquisitionStateMachine::new(manager, calibrator, precalibrator, sink, config)
        });
        (machine, records)
    }

    fn drain(records: &mut UnboundedReceiver<ExportRecord>) -> Vec<ExportRecord> {
        let mut out = Vec::new();
        while let Ok(record) = records.try_recv() {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let (machine, _records) = machine(DaqConfig::default());
        let xbn = machine.manager().current_xbn();
        assert_eq!(
            machine.transition(AcquisitionState::Data),
            Err(StateError::IllegalTransition {
                from: AcquisitionState::Init,
                to: AcquisitionState::Data
            })
        );
        assert_eq!(machine.state(), AcquisitionState::Init);
        assert_eq!(machine.manager().current_xbn(), xbn);
    }

    #[tokio::test]
    async fn walks_from_survey_to_data() {
        let config = DaqConfig {
            precal_trigger: "hotcell;maxframes=1".to_string(),
            ..DaqConfig::default()
        };
        let (machine, mut records) = machine(config);
        machine.transition(AcquisitionState::Survey).unwrap();

        let survey = machine.manager().current_xbn();
        machine.on_stage_complete(StageKind::Quality, survey, AcquisitionState::Survey);
        assert_eq!(machine.state(), AcquisitionState::Precalibration);

        let precal = machine.manager().current_xbn();
        machine.on_stage_complete(StageKind::PreCalibration, precal, AcquisitionState::Precalibration);
        assert_eq!(machine.state(), AcquisitionState::Calibration);

        for i in 0..100u64 {
            machine.calibrator.add_frame((i % 50) as u8, i * 33_000_000);
        }
        let calibration = machine.manager().current_xbn();
        machine.on_stage_complete(StageKind::L1, calibration, AcquisitionState::Calibration);
        assert_eq!(machine.state(), AcquisitionState::Data);
        assert!(machine.calibrator.thresholds().l1 < 255.0);

        let exported = drain(&mut records);
        assert!(matches!(exported[0], ExportRecord::Precalibration(_)));
        assert!(matches!(exported[1], ExportRecord::Calibration(_)));
        assert_eq!(machine.manager().pending_blocks(), 2);
    }

    #[tokio::test]
    async fn stale_requests_are_ignored() {
        let (machine, _records) = machine(DaqConfig::default());
        machine.transition(AcquisitionState::Survey).unwrap();
        let survey = machine.manager().current_xbn();
        machine.transition(AcquisitionState::Calibration).unwrap();

        assert_eq!(machine.request(survey, AcquisitionState::Stabilization), Ok(None));
        machine.on_stage_complete(StageKind::Quality, survey, AcquisitionState::Survey);
        assert_eq!(machine.state(), AcquisitionState::Calibration);
    }

    #[tokio::test]
    async fn quality_failures_are_debounced() {
        let (machine, _records) = machine(DaqConfig::default());
        machine.transition(AcquisitionState::Survey).unwrap();
        machine.transition(AcquisitionState::Calibration).unwrap();
        let xbn = machine.manager().current_xbn();

        machine.report_quality(xbn, false);
        machine.report_quality(xbn, false);
        machine.report_quality(xbn, true);
        machine.report_quality(xbn, false);
        machine.report_quality(xbn, false);
        assert_eq!(machine.state(), AcquisitionState::Calibration);

        machine.report_quality(xbn, false);
        assert_eq!(machine.state(), AcquisitionState::Stabilization);
    }

    #[tokio::test]
    async fn stabilization_returns_to_calibration_after_precalibration() {
        let config = DaqConfig {
            precal_trigger: "weighting;maxframes=1".to_string(),
            ..DaqConfig::default()
        };
        let (machine, _records) = machine(config);
        machine.transition(AcquisitionState::Survey).unwrap();
        machine.transition(AcquisitionState::Stabilization).unwrap();

        let xbn = machine.manager().current_xbn();
        machine.on_stage_complete(StageKind::L1, xbn, AcquisitionState::Stabilization);
        assert_eq!(machine.state(), AcquisitionState::Precalibration);

        let xbn = machine.manager().current_xbn();
        machine.on_stage_complete(StageKind::PreCalibration, xbn, AcquisitionState::Precalibration);
        machine.transition(AcquisitionState::Stabilization).unwrap();
        let xbn = machine.manager().current_xbn();
        machine.on_stage_complete(StageKind::L1, xbn, AcquisitionState::Stabilization);
        assert_eq!(machine.state(), AcquisitionState::Calibration);
    }

    #[tokio::test]
    async fn idle_outside_data_aborts_the_block() {
        let (machine, mut records) = machine(DaqConfig::default());
        machine.transition(AcquisitionState::Survey).unwrap();
        machine.transition(AcquisitionState::Calibration).unwrap();
        machine.transition(AcquisitionState::Idle).unwrap();

        // The aborted calibration block had no events and is dropped.
        assert_eq!(machine.manager().flush_committed_blocks_at(u64::MAX), 1);
        assert!(drain(&mut records).is_empty());
        assert!(machine.transition(AcquisitionState::Calibration).is_err());
    }

    #[test]
    fn reconfigure_is_only_reachable_from_data_and_idle() {
        use AcquisitionState::*;
        let all = [Init, Survey, Precalibration, Calibration, Stabilization, Data, Idle, Reconfigure];
        let sources: Vec<_> = all
            .iter()
            .filter(|from| from.can_transition_to(Reconfigure))
            .copied()
            .collect();
        assert_eq!(sources, vec![Data, Idle]);
    }
}
