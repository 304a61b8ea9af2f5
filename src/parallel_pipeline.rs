// THEORY:
// The `parallel_pipeline` module is the scheduling layer of the trigger. It
// knows nothing about what a stage does with a frame; it only knows how frames
// move between stages and who pays for them.
//
// Key architectural principles:
// 1.  **One shared worker pool**: a single dispatcher hands jobs round-robin to
//     a fixed set of workers. Every stage of every block submits into the same
//     pool, so the CPU budget is set in exactly one place.
// 2.  **Stages as an enum registry**: `StageKind` names a stage and
//     `StageConfig` carries its parsed options. A `TriggerProcessor` wraps one
//     of them with counters and a link to the next stage; together they form
//     a `TriggerChain`.
// 3.  **Every frame ends in exactly one place**: a task's outcome either
//     forwards the frame to the next stage or retires and clears it. No other
//     code path finishes a frame.
// 4.  **Completion is counted, not polled**: a processor configured with
//     `maxframes` tells the state machine when its N-th frame has been
//     consumed, exactly once.

use crate::config::DaqConfig;
use crate::core_modules::acquisition_block::{AcquisitionBlock, StageSummary};
use crate::core_modules::block_manager::PassRateMonitor;
use crate::core_modules::calibrator::ThresholdCalibrator;
use crate::core_modules::frame::FrameBuffer;
use crate::core_modules::l0_zero_bias::{self, L0Config};
use crate::core_modules::l1_trigger::{self, L1Config};
use crate::core_modules::l2_reco::{self, L2Config};
use crate::core_modules::precalibration::{self, PreCalibrator};
use crate::core_modules::quality_gate::{self, QualityConfig};
use crate::core_modules::state_machine::{AcquisitionState, AcquisitionStateMachine};
use crate::core_modules::trigger_config::TriggerConfig;
use crate::error::TriggerError;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    task_sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    /// Spawns the dispatcher and `size` workers on the current tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<Job>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel::<Job>()).unzip();

        let mut workers = Vec::with_capacity(size + 1);
        workers.push(tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(job) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(job).is_err() {
                    log::error!("worker {} is gone; dropping job", worker_idx);
                }
                worker_idx = (worker_idx + 1) % worker_senders.len();
            }
        }));

        for (worker_idx, mut worker_receiver) in worker_receivers.into_iter().enumerate() {
            let in_flight = in_flight.clone();
            let idle = idle.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = worker_receiver.recv().await {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("a trigger task panicked on worker {}", worker_idx);
                    }
                    if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                        idle.notify_waiters();
                    }
                }
            }));
        }

        Self {
            task_sender: Mutex::new(Some(task_sender)),
            workers: Mutex::new(workers),
            in_flight,
            idle,
        }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), TriggerError> {
        let sender = self.task_sender.lock();
        let sender = sender.as_ref().ok_or(TriggerError::PoolClosed)?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        sender.send(Box::new(job)).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            TriggerError::PoolClosed
        })
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting jobs, lets the queued ones finish and joins the workers.
    pub async fn shutdown(&self) {
        self.task_sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                log::error!("worker task failed to join: {}", err);
            }
        }
    }
}

/// What a stage decided about one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Hand the frame to the next stage, crediting `pass`.
    Forward { pass: u64 },
    /// The stage used the frame up; it passes but goes no further.
    Consume,
    /// The frame failed the stage.
    Reject,
    /// The frame could not be processed at all.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    L0,
    Quality,
    PreCalibration,
    L1,
    L2,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::L0 => "L0",
            StageKind::Quality => "quality",
            StageKind::PreCalibration => "precal",
            StageKind::L1 => "L1",
            StageKind::L2 => "L2",
        }
    }

    /// Stages that only accept frames whose plane has been copied out of the
    /// sensor slot.
    pub fn requires_claimed(&self) -> bool {
        matches!(self, StageKind::L2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageConfig {
    L0(L0Config),
    Quality(QualityConfig),
    PreCalibration,
    L1(L1Config),
    L2(L2Config),
}

impl StageConfig {
    pub fn parse(kind: StageKind, trigger: &TriggerConfig) -> Self {
        match kind {
            StageKind::L0 => StageConfig::L0(L0Config::from_trigger(trigger)),
            StageKind::Quality => StageConfig::Quality(QualityConfig::from_trigger(trigger)),
            StageKind::PreCalibration => StageConfig::PreCalibration,
            StageKind::L1 => StageConfig::L1(L1Config::from_trigger(trigger)),
            StageKind::L2 => StageConfig::L2(L2Config::from_trigger(trigger)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub processed: u64,
    pub pass: u64,
    pub skip: u64,
}

#[derive(Default)]
struct StageCounters {
    processed: AtomicU64,
    pass: AtomicU64,
    skip: AtomicU64,
    consumed: AtomicU64,
}

/// The services every stage task may reach.
#[derive(Clone)]
pub struct StageContext {
    pub pool: Arc<WorkerPool>,
    pub calibrator: Arc<ThresholdCalibrator>,
    pub precalibrator: Arc<PreCalibrator>,
    pub pass_monitor: Arc<PassRateMonitor>,
    pub state_machine: Weak<AcquisitionStateMachine>,
}

impl StageContext {
    pub fn report_quality(&self, block: &AcquisitionBlock, passed: bool) {
        if let Some(state_machine) = self.state_machine.upgrade() {
            state_machine.report_quality(block.xbn(), passed);
        }
    }

    pub fn on_stage_complete(&self, kind: StageKind, block: &AcquisitionBlock) {
        if let Some(state_machine) = self.state_machine.upgrade() {
            state_machine.on_stage_complete(kind, block.xbn(), block.state());
        }
    }
}

pub struct TriggerProcessor {
    kind: StageKind,
    trigger: TriggerConfig,
    config: StageConfig,
    max_frames: Option<u64>,
    counters: StageCounters,
    next: Option<Arc<TriggerProcessor>>,
    ctx: StageContext,
}

impl TriggerProcessor {
    pub fn new(
        kind: StageKind,
        trigger: TriggerConfig,
        max_frames: Option<u64>,
        next: Option<Arc<TriggerProcessor>>,
        ctx: StageContext,
    ) -> Self {
        let max_frames = match trigger.get_str("maxframes") {
            None => max_frames,
            Some(raw) => match raw.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    log::warn!(
                        "{}: invalid maxframes '{}', using {:?}",
                        trigger.name(),
                        raw,
                        max_frames
                    );
                    max_frames
                }
            },
        };
        Self {
            kind,
            config: StageConfig::parse(kind, &trigger),
            trigger,
            max_frames,
            counters: StageCounters::default(),
            next,
            ctx,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn max_frames(&self) -> Option<u64> {
        self.max_frames
    }

    pub fn counts(&self) -> StageCounts {
        StageCounts {
            processed: self.counters.processed.load(Ordering::Acquire),
            pass: self.counters.pass.load(Ordering::Acquire),
            skip: self.counters.skip.load(Ordering::Acquire),
        }
    }

    pub fn summary(&self) -> StageSummary {
        let counts = self.counts();
        StageSummary {
            stage: self.kind.name().to_string(),
            config: self.trigger.to_string(),
            processed: counts.processed,
            pass: counts.pass,
            skip: counts.skip,
        }
    }

    /// Queues `frame` for this stage. The frame must already carry its block.
    pub fn submit_frame(self: &Arc<Self>, frame: Arc<FrameBuffer>) -> Result<(), TriggerError> {
        if self.kind.requires_claimed() && frame.is_outstanding() {
            return Err(TriggerError::FrameOutstanding {
                frame_id: frame.id(),
                stage: self.kind.name(),
            });
        }
        let block = frame
            .block()
            .cloned()
            .ok_or(TriggerError::Untagged { frame_id: frame.id() })?;

        let sequence = self.counters.processed.fetch_add(1, Ordering::AcqRel);
        let stage = self.clone();
        self.ctx
            .pool
            .execute(move || stage.run(frame, block, sequence))
    }

    fn run(&self, frame: Arc<FrameBuffer>, block: Arc<AcquisitionBlock>, sequence: u64) {
        let outcome = match &self.config {
            StageConfig::L0(config) => l0_zero_bias::process_frame(config, &frame, sequence),
            StageConfig::Quality(config) => {
                quality_gate::process_frame(config, &frame, &block, &self.ctx)
            }
            StageConfig::PreCalibration => precalibration::process_frame(&frame, &self.ctx),
            StageConfig::L1(_) => l1_trigger::process_frame(&frame, &block, &self.ctx),
            StageConfig::L2(config) => l2_reco::process_frame(config, &frame, &block, &self.ctx),
        };
        self.settle(outcome, frame, &block);
    }

    fn settle(&self, outcome: TaskOutcome, frame: Arc<FrameBuffer>, block: &AcquisitionBlock) {
        let consumed = match outcome {
            TaskOutcome::Forward { pass } => {
                self.counters.pass.fetch_add(pass, Ordering::AcqRel);
                match &self.next {
                    Some(next) => {
                        if let Err(err) = next.submit_frame(frame.clone()) {
                            log::error!("{} could not forward frame {}: {}", self.kind.name(), frame.id(), err);
                            finish(&frame);
                            debug_assert!(
                                !matches!(err, TriggerError::FrameOutstanding { .. }),
                                "{}",
                                err
                            );
                        }
                    }
                    None => finish(&frame),
                }
                true
            }
            TaskOutcome::Consume => {
                self.counters.pass.fetch_add(1, Ordering::AcqRel);
                finish(&frame);
                true
            }
            TaskOutcome::Reject => {
                self.counters.skip.fetch_add(1, Ordering::AcqRel);
                finish(&frame);
                false
            }
            TaskOutcome::Drop => {
                self.counters.skip.fetch_add(1, Ordering::AcqRel);
                log::warn!("{} dropped frame {}", self.kind.name(), frame.id());
                finish(&frame);
                false
            }
        };

        if !consumed {
            return;
        }
        if let Some(max) = self.max_frames {
            let done = self.counters.consumed.fetch_add(1, Ordering::AcqRel) + 1;
            if done == max {
                log::debug!("{} reached {} frames in block {}", self.kind.name(), max, block.xbn());
                self.ctx.on_stage_complete(self.kind, block);
            }
        }
    }
}

/// Retires and clears a frame that will go no further.
fn finish(frame: &FrameBuffer) {
    frame.retire();
    if let Err(err) = frame.clear() {
        log::error!("{}", err);
    }
}

/// The ordered stages one block runs its frames through.
pub struct TriggerChain {
    stages: Vec<Arc<TriggerProcessor>>,
}

impl TriggerChain {
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Links `(kind, options, maxframes)` entries front to back.
    pub fn build(specs: Vec<(StageKind, TriggerConfig, Option<u64>)>, ctx: &StageContext) -> Self {
        let mut stages: Vec<Arc<TriggerProcessor>> = Vec::with_capacity(specs.len());
        let mut next = None;
        for (kind, trigger, max_frames) in specs.into_iter().rev() {
            let stage = Arc::new(TriggerProcessor::new(kind, trigger, max_frames, next, ctx.clone()));
            next = Some(stage.clone());
            stages.push(stage);
        }
        stages.reverse();
        Self { stages }
    }

    /// The chain a block in `state` runs.
    pub fn for_state(state: AcquisitionState, config: &DaqConfig, ctx: &StageContext) -> Self {
        let l0 = || (StageKind::L0, TriggerConfig::parse(&config.l0_trigger), None);
        let quality = |max| (StageKind::Quality, TriggerConfig::parse(&config.quality_trigger), max);
        let l1 = |max| (StageKind::L1, TriggerConfig::parse(&config.l1_trigger), max);

        let specs = match state {
            AcquisitionState::Survey => vec![quality(Some(config.survey_sample_frames))],
            AcquisitionState::Precalibration => match ctx.precalibrator.current_step() {
                Some(step) => vec![
                    l0(),
                    quality(None),
                    (
                        StageKind::PreCalibration,
                        TriggerConfig::new(step.name()).with_option("maxframes", step.max_frames),
                        Some(step.max_frames),
                    ),
                ],
                None => {
                    log::warn!("precalibration has no step left to run");
                    Vec::new()
                }
            },
            AcquisitionState::Calibration => {
                vec![l0(), quality(None), l1(Some(config.calibration_sample_frames))]
            }
            AcquisitionState::Stabilization => {
                vec![l0(), quality(None), l1(Some(config.stabilization_sample_frames))]
            }
            AcquisitionState::Data => vec![
                l0(),
                quality(None),
                l1(None),
                (StageKind::L2, TriggerConfig::parse(&config.l2_trigger), None),
            ],
            AcquisitionState::Init | AcquisitionState::Idle | AcquisitionState::Reconfigure => {
                Vec::new()
            }
        };
        Self::build(specs, ctx)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Arc<TriggerProcessor>] {
        &self.stages
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Arc<TriggerProcessor>> {
        self.stages.iter().find(|stage| stage.kind() == kind)
    }

    /// Starts `frame` down the chain. A chain without stages finishes the frame
    /// on the spot.
    pub fn submit(&self, frame: Arc<FrameBuffer>) -> Result<(), TriggerError> {
        match self.stages.first() {
            Some(first) => first.submit_frame(frame),
            None => {
                finish(&frame);
                Ok(())
            }
        }
    }

    pub fn summaries(&self) -> Vec<StageSummary> {
        self.stages.iter().map(|stage| stage.summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::acquisition_block::{BlockParams, RecentEvents};
    use crate::core_modules::calibrator::Thresholds;
    use crate::core_modules::frame::{FrameMetadata, SensorBufferPool};
    use crate::core_modules::precalibration::parse_steps;

    fn context() -> StageContext {
        StageContext {
            pool: Arc::new(WorkerPool::new(2)),
            calibrator: Arc::new(ThresholdCalibrator::new(100, 2, 10.0)),
            precalibrator: Arc::new(PreCalibrator::new(parse_steps("hotcell;maxframes=5"))),
            pass_monitor: Arc::new(PassRateMonitor::new(25)),
            state_machine: Weak::new(),
        }
    }

    fn data_block(chain: TriggerChain) -> Arc<AcquisitionBlock> {
        Arc::new(AcquisitionBlock::new(
            BlockParams {
                xbn: 1,
                run_id: 1,
                state: AcquisitionState::Data,
                thresholds: Thresholds { l1: 10.0, l2: 9 },
                start_location: None,
                battery_start: None,
                resolution: (8, 8),
            },
            chain,
            Arc::new(RecentEvents::new(25)),
        ))
    }

    fn frame(pool: &SensorBufferPool, value: u8, rotation_zz: f32) -> Arc<FrameBuffer> {
        let lease = pool.try_acquire().expect("free slot");
        lease.write_raw(&[1u8; 64]);
        lease.with_plane_mut(|plane| plane.put_pixel(3, 3, image::Luma([value])));
        Arc::new(
            FrameBuffer::builder(lease)
                .metadata(FrameMetadata {
                    rotation_zz: Some(rotation_zz),
                    facing_back: true,
                    ..FrameMetadata::default()
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn outstanding_frame_is_refused_by_l2() {
        let ctx = context();
        let l2 = Arc::new(TriggerProcessor::new(
            StageKind::L2,
            TriggerConfig::parse("default"),
            None,
            None,
            ctx.clone(),
        ));
        let block = data_block(TriggerChain::empty());
        let pool = SensorBufferPool::new(1, 8, 8);
        let frame = frame(&pool, 50, 1.0);
        block.try_assign(&frame).unwrap();

        let err = l2.submit_frame(frame.clone()).unwrap_err();
        assert_eq!(
            err,
            TriggerError::FrameOutstanding {
                frame_id: frame.id(),
                stage: "L2"
            }
        );
        assert_eq!(l2.counts().processed, 0);

        frame.claim().unwrap();
        l2.submit_frame(frame.clone()).unwrap();
        ctx.pool.wait_idle().await;
        assert_eq!(l2.counts().processed, 1);
    }

    #[tokio::test]
    async fn quality_rejected_frames_never_reach_l2() {
        let ctx = context();
        let config = DaqConfig {
            l0_trigger: "default;prescale=0".to_string(),
            quality_trigger: "facedown;orient=10;mean=10".to_string(),
            l1_trigger: "default".to_string(),
            l2_trigger: "default".to_string(),
            ..DaqConfig::default()
        };
        let block = data_block(TriggerChain::for_state(AcquisitionState::Data, &config, &ctx));
        let pool = SensorBufferPool::new(4, 8, 8);

        // Two bright frames, one of them lying screen-up.
        let good = frame(&pool, 200, 1.0);
        let flipped = frame(&pool, 200, -1.0);
        for frame in [&good, &flipped] {
            block.try_assign(frame).unwrap();
            block.chain().submit(frame.clone()).unwrap();
        }
        ctx.pool.wait_idle().await;

        let chain = block.chain();
        let quality = chain.stage(StageKind::Quality).unwrap().counts();
        assert_eq!((quality.processed, quality.pass, quality.skip), (2, 1, 1));
        let l2 = chain.stage(StageKind::L2).unwrap().counts();
        assert_eq!(l2.processed, 1);
        assert_eq!(l2.pass, 1);
        assert_eq!(block.outstanding(), 0);
        assert_eq!(block.event_count(), 1);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn sub_threshold_frame_is_released_without_claim() {
        let ctx = context();
        let config = DaqConfig::default();
        let block = data_block(TriggerChain::for_state(AcquisitionState::Data, &config, &ctx));
        let pool = SensorBufferPool::new(1, 8, 8);

        let dim = frame(&pool, 5, 1.0);
        block.try_assign(&dim).unwrap();
        block.chain().submit(dim.clone()).unwrap();
        ctx.pool.wait_idle().await;

        let l1 = block.chain().stage(StageKind::L1).unwrap().counts();
        assert_eq!((l1.pass, l1.skip), (0, 1));
        assert_eq!(block.chain().stage(StageKind::L2).unwrap().counts().processed, 0);
        assert_eq!(ctx.calibrator.sample_count(), 1);
        assert_eq!(block.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn empty_chain_finishes_frames_immediately() {
        let block = data_block(TriggerChain::empty());
        let pool = SensorBufferPool::new(1, 8, 8);
        let frame = frame(&pool, 0, 1.0);
        block.try_assign(&frame).unwrap();
        block.chain().submit(frame.clone()).unwrap();
        assert_eq!(block.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stall_the_pool() {
        let pool = WorkerPool::new(1);
        pool.execute(|| panic!("boom")).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.wait_idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        pool.shutdown().await;
        assert_eq!(pool.execute(|| {}), Err(TriggerError::PoolClosed));
    }

    #[tokio::test]
    async fn malformed_maxframes_falls_back_to_the_stage_default() {
        let ctx = context();
        let stage = |raw: &str| {
            TriggerProcessor::new(StageKind::L1, TriggerConfig::parse(raw), Some(45), None, ctx.clone())
                .max_frames()
        };
        assert_eq!(stage("default;maxframes=lots"), Some(45));
        assert_eq!(stage("default;maxframes=-3"), Some(45));
        assert_eq!(stage("default;maxframes=12"), Some(12));
        assert_eq!(stage("default"), Some(45));
    }

    #[test]
    fn chains_follow_the_acquisition_state() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let ctx = context();
        let config = DaqConfig::default();
        let kinds = |state| {
            TriggerChain::for_state(state, &config, &ctx)
                .stages()
                .iter()
                .map(|s| s.kind())
                .collect::<Vec<_>>()
        };

        assert_eq!(kinds(AcquisitionState::Survey), vec![StageKind::Quality]);
        assert_eq!(
            kinds(AcquisitionState::Precalibration),
            vec![StageKind::L0, StageKind::Quality, StageKind::PreCalibration]
        );
        assert_eq!(
            kinds(AcquisitionState::Data),
            vec![StageKind::L0, StageKind::Quality, StageKind::L1, StageKind::L2]
        );
        assert!(kinds(AcquisitionState::Idle).is_empty());

        let survey = TriggerChain::for_state(AcquisitionState::Survey, &config, &ctx);
        assert_eq!(survey.stages()[0].max_frames(), Some(config.survey_sample_frames));
        let precal = TriggerChain::for_state(AcquisitionState::Precalibration, &config, &ctx);
        assert_eq!(precal.stage(StageKind::PreCalibration).unwrap().max_frames(), Some(5));
    }
}
