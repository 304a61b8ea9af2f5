// THEORY:
// The `AcquisitionBlockManager` owns the single "current" block and everything
// that happens to blocks after they stop being current. It is the only place a
// frame is stamped with a block, which is what makes the per-block accounting
// trustworthy.
//
// Key architectural principles:
// 1.  **One lock for check, rotate and assign**: while a frame is being stamped
//     nobody else can swap the current block out, so a frame can never land in
//     a block that has already been frozen.
// 2.  **Rotation by age only in DATA**: calibration phases end when their
//     counters fill up, not on a clock. A DATA block that outlives the block
//     period is rotated, and the thresholds are refreshed first so the next
//     block starts from the newest calibration.
// 3.  **Export exactly once**: retired blocks wait on a pending list until all
//     their frames are cleared and a short grace period has passed. A block
//     whose frames never come back is exported anyway once it goes stale. In
//     both cases it leaves the list in the same step it is exported.

use crate::collaborators::{DeviceStatus, ExportSink};
use crate::config::{DaqConfig, SharedConfig};
use crate::core_modules::acquisition_block::{AcquisitionBlock, BlockParams, RecentEvents};
use crate::core_modules::frame::{FrameBuffer, monotonic_nanos};
use crate::core_modules::state_machine::AcquisitionState;
use crate::error::DaqError;
use crate::parallel_pipeline::{StageContext, TriggerChain};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the acquisition times of the most recent L2 passes.
pub struct PassRateMonitor {
    capacity: usize,
    passes: Mutex<VecDeque<u64>>,
}

impl PassRateMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            passes: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, acquired_nanos: u64) {
        let mut passes = self.passes.lock();
        if passes.len() >= self.capacity {
            passes.pop_front();
        }
        passes.push_back(acquired_nanos);
    }

    pub fn clear(&self) {
        self.passes.lock().clear();
    }

    /// Passes per minute over the window, once the window is full.
    pub fn rate_per_minute(&self) -> Option<f64> {
        let passes = self.passes.lock();
        if passes.len() < self.capacity {
            return None;
        }
        let first = passes.iter().min().copied()?;
        let last = passes.iter().max().copied()?;
        let span_minutes = (last - first) as f64 / 60e9;
        if span_minutes <= 0.0 {
            return Some(f64::INFINITY);
        }
        Some((passes.len() - 1) as f64 / span_minutes)
    }
}

pub struct AcquisitionBlockManager {
    config: SharedConfig,
    ctx: StageContext,
    export: Arc<dyn ExportSink>,
    device: Arc<dyn DeviceStatus>,
    run_id: u64,
    next_xbn: AtomicU64,
    current: Mutex<Arc<AcquisitionBlock>>,
    committed: Mutex<Vec<Arc<AcquisitionBlock>>>,
    recent: Arc<RecentEvents>,
}

impl AcquisitionBlockManager {
    pub fn new(
        config: SharedConfig,
        ctx: StageContext,
        export: Arc<dyn ExportSink>,
        device: Arc<dyn DeviceStatus>,
        run_id: u64,
    ) -> Self {
        let recent = Arc::new(RecentEvents::new(config.read().recent_events));
        let first = Self::build_block(
            &config.read(),
            &ctx,
            device.as_ref(),
            &recent,
            run_id,
            0,
            AcquisitionState::Init,
        );
        Self {
            config,
            ctx,
            export,
            device,
            run_id,
            next_xbn: AtomicU64::new(1),
            current: Mutex::new(first),
            committed: Mutex::new(Vec::new()),
            recent,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn recent_events(&self) -> &Arc<RecentEvents> {
        &self.recent
    }

    pub fn current_xbn(&self) -> u64 {
        self.current.lock().xbn()
    }

    /// The current block without rotating it.
    pub fn peek_block(&self) -> Arc<AcquisitionBlock> {
        self.current.lock().clone()
    }

    /// The block new frames go to, rotating a DATA block that has run longer
    /// than the block period.
    pub fn current_block(&self) -> Arc<AcquisitionBlock> {
        let mut current = self.current.lock();
        self.rotate_if_expired(&mut current);
        current.clone()
    }

    /// Stamps `frame` with the current block and starts it down that block's
    /// chain.
    pub fn assign_frame(&self, frame: Arc<FrameBuffer>) -> Result<Arc<AcquisitionBlock>, DaqError> {
        let block = {
            let mut current = self.current.lock();
            self.rotate_if_expired(&mut current);
            current.try_assign(&frame)?;
            current.clone()
        };
        if let Err(err) = block.chain().submit(frame.clone()) {
            frame.retire();
            frame.clear()?;
            return Err(err.into());
        }
        Ok(block)
    }

    /// Freezes and retires the current block and starts a fresh one in `state`.
    pub fn new_block(&self, state: AcquisitionState) -> Arc<AcquisitionBlock> {
        let mut current = self.current.lock();
        self.swap_block(&mut current, state)
    }

    /// Marks the current block as aborted. It is still retired normally.
    pub fn abort_current(&self) {
        let current = self.current.lock();
        log::warn!("aborting block {} ({:?})", current.xbn(), current.state());
        current.abort();
    }

    /// Blocks retired but not yet exported.
    pub fn pending_blocks(&self) -> usize {
        self.committed.lock().len()
    }

    pub fn flush_committed_blocks(&self) -> usize {
        self.flush_committed_blocks_at(monotonic_nanos())
    }

    /// Exports every pending block that is finalized and past the grace period,
    /// or stale. Returns how many left the pending list.
    pub fn flush_committed_blocks_at(&self, now_nanos: u64) -> usize {
        let (grace, stale) = {
            let config = self.config.read();
            (
                config.finalize_grace.as_nanos() as u64,
                config.stale_timeout.as_nanos() as u64,
            )
        };

        let ready: Vec<Arc<AcquisitionBlock>> = {
            let mut committed = self.committed.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = committed.drain(..).partition(|block| {
                let frozen_at = block.end_time().map(|t| t.nanos).unwrap_or(now_nanos);
                let age = now_nanos.saturating_sub(frozen_at);
                if block.is_finalized() && age >= grace {
                    true
                } else if age >= stale {
                    log::warn!(
                        "block {} went stale with {} of {} frames outstanding",
                        block.xbn(),
                        block.outstanding(),
                        block.assigned()
                    );
                    true
                } else {
                    false
                }
            });
            *committed = waiting;
            ready
        };

        for block in &ready {
            if block.is_aborted() && block.event_count() == 0 {
                log::debug!("dropping aborted block {} without events", block.xbn());
                continue;
            }
            log::info!(
                "exporting block {} ({:?}, {} events)",
                block.xbn(),
                block.state(),
                block.event_count()
            );
            self.export.export_block(block.snapshot());
        }
        ready.len()
    }

    /// Aborts and rotates the current DATA block when L2 passes arrive far
    /// faster than the target rate. Returns whether it did.
    pub fn check_pass_rate(&self) -> bool {
        let (target, tolerance, prescale, trigger_lock) = {
            let config = self.config.read();
            (
                config.target_events_per_minute,
                config.pass_rate_tolerance,
                config.l1_config().prescale,
                config.trigger_lock,
            )
        };
        let Some(rate) = self.ctx.pass_monitor.rate_per_minute() else {
            return false;
        };
        if rate <= target * tolerance {
            return false;
        }

        let mut current = self.current.lock();
        if current.state() != AcquisitionState::Data {
            return false;
        }
        log::warn!(
            "L2 rate {:.1}/min exceeds {:.1}/min; recalibrating block {}",
            rate,
            target * tolerance,
            current.xbn()
        );
        current.abort();
        self.ctx.pass_monitor.clear();
        self.ctx
            .calibrator
            .update_thresholds(target, prescale, trigger_lock);
        self.swap_block(&mut current, AcquisitionState::Data);
        true
    }

    fn rotate_if_expired(&self, current: &mut Arc<AcquisitionBlock>) {
        if current.state() != AcquisitionState::Data {
            return;
        }
        let (period, target, prescale, trigger_lock) = {
            let config = self.config.read();
            (
                config.block_period.as_nanos() as u64,
                config.target_events_per_minute,
                config.l1_config().prescale,
                config.trigger_lock,
            )
        };
        let age = monotonic_nanos().saturating_sub(current.start_time().nanos);
        if age < period {
            return;
        }
        log::debug!("block {} reached the block period, rotating", current.xbn());
        self.ctx
            .calibrator
            .update_thresholds(target, prescale, trigger_lock);
        self.swap_block(current, AcquisitionState::Data);
    }

    fn swap_block(&self, current: &mut Arc<AcquisitionBlock>, state: AcquisitionState) -> Arc<AcquisitionBlock> {
        let fresh = self.make_block(state);
        let old = std::mem::replace(current, fresh.clone());
        old.freeze(self.device.battery_temperature());
        self.retire_block(old);
        fresh
    }

    fn make_block(&self, state: AcquisitionState) -> Arc<AcquisitionBlock> {
        let xbn = self.next_xbn.fetch_add(1, Ordering::AcqRel);
        Self::build_block(
            &self.config.read(),
            &self.ctx,
            self.device.as_ref(),
            &self.recent,
            self.run_id,
            xbn,
            state,
        )
    }

    fn build_block(
        config: &DaqConfig,
        ctx: &StageContext,
        device: &dyn DeviceStatus,
        recent: &Arc<RecentEvents>,
        run_id: u64,
        xbn: u64,
        state: AcquisitionState,
    ) -> Arc<AcquisitionBlock> {
        log::debug!("starting block {} in {:?}", xbn, state);
        Arc::new(AcquisitionBlock::new(
            BlockParams {
                xbn,
                run_id,
                state,
                thresholds: ctx.calibrator.thresholds(),
                start_location: device.location(),
                battery_start: device.battery_temperature(),
                resolution: (config.sensor_width, config.sensor_height),
            },
            TriggerChain::for_state(state, config, ctx),
            recent.clone(),
        ))
    }

    /// Queues a frozen block for export. Only phases that produce results are
    /// exported.
    fn retire_block(&self, block: Arc<AcquisitionBlock>) {
        match block.state() {
            AcquisitionState::Precalibration
            | AcquisitionState::Calibration
            | AcquisitionState::Data => self.committed.lock().push(block),
            state => log::debug!("discarding {:?} block {}", state, block.xbn()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelExportSink, ExportRecord, StaticDeviceStatus};
    use crate::core_modules::calibrator::ThresholdCalibrator;
    use crate::core_modules::frame::SensorBufferPool;
    use crate::core_modules::precalibration::{PreCalibrator, parse_steps};
    use crate::parallel_pipeline::WorkerPool;
    use parking_lot::RwLock;
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn manager(config: DaqConfig) -> (AcquisitionBlockManager, UnboundedReceiver<ExportRecord>) {
        let ctx = StageContext {
            pool: Arc::new(WorkerPool::new(1)),
            calibrator: Arc::new(ThresholdCalibrator::new(100, 2, 30.0)),
            precalibrator: Arc::new(PreCalibrator::new(parse_steps(&config.precal_trigger))),
            pass_monitor: Arc::new(PassRateMonitor::new(config.pass_rate_window)),
            state_machine: Weak::new(),
        };
        let (sink, records) = ChannelExportSink::new();
        let manager = AcquisitionBlockManager::new(
            Arc::new(RwLock::new(config)),
            ctx,
            Arc::new(sink),
            Arc::new(StaticDeviceStatus::default()),
            42,
        );
        (manager, records)
    }

    fn exported_xbns(records: &mut UnboundedReceiver<ExportRecord>) -> Vec<u64> {
        let mut xbns = Vec::new();
        while let Ok(record) = records.try_recv() {
            if let ExportRecord::Block(snapshot) = record {
                xbns.push(snapshot.xbn);
            }
        }
        xbns
    }

    #[tokio::test]
    async fn starved_block_is_exported_once_after_going_stale() {
        let (manager, mut records) = manager(DaqConfig::default());
        manager.new_block(AcquisitionState::Data);
        let block = manager.current_block();

        // Ten frames assigned, seven of them come back.
        let pool = SensorBufferPool::new(10, 4, 4);
        let frames: Vec<FrameBuffer> = (0..10)
            .map(|_| FrameBuffer::builder(pool.try_acquire().unwrap()).build())
            .collect();
        for frame in &frames {
            block.try_assign(frame).unwrap();
        }
        for frame in &frames[..7] {
            frame.retire();
            frame.clear().unwrap();
        }
        manager.new_block(AcquisitionState::Data);
        let frozen_at = block.end_time().unwrap().nanos;

        assert_eq!(manager.flush_committed_blocks_at(frozen_at + 5_000_000_000), 0);
        assert!(exported_xbns(&mut records).is_empty());

        assert_eq!(manager.flush_committed_blocks_at(frozen_at + 31_000_000_000), 1);
        assert_eq!(exported_xbns(&mut records), vec![block.xbn()]);

        assert_eq!(manager.flush_committed_blocks_at(frozen_at + 62_000_000_000), 0);
        assert!(exported_xbns(&mut records).is_empty());
        assert_eq!(manager.pending_blocks(), 0);
    }

    #[tokio::test]
    async fn finalized_block_waits_for_the_grace_period() {
        let (manager, mut records) = manager(DaqConfig::default());
        manager.new_block(AcquisitionState::Calibration);
        let block = manager.current_block();
        manager.new_block(AcquisitionState::Data);
        let frozen_at = block.end_time().unwrap().nanos;

        assert_eq!(manager.flush_committed_blocks_at(frozen_at + 1_000_000_000), 0);
        assert_eq!(manager.flush_committed_blocks_at(frozen_at + 2_500_000_000), 1);
        assert_eq!(exported_xbns(&mut records), vec![block.xbn()]);
    }

    #[tokio::test]
    async fn only_result_phases_are_exported() {
        let (manager, mut records) = manager(DaqConfig::default());
        manager.new_block(AcquisitionState::Survey);
        manager.new_block(AcquisitionState::Stabilization);
        manager.new_block(AcquisitionState::Idle);
        assert_eq!(manager.pending_blocks(), 0);
        assert_eq!(manager.current_xbn(), 3);
        manager.flush_committed_blocks_at(u64::MAX);
        assert!(exported_xbns(&mut records).is_empty());
    }

    #[tokio::test]
    async fn aborted_block_without_events_is_dropped() {
        let (manager, mut records) = manager(DaqConfig::default());
        manager.new_block(AcquisitionState::Data);
        manager.abort_current();
        manager.new_block(AcquisitionState::Idle);

        assert_eq!(manager.flush_committed_blocks_at(u64::MAX), 1);
        assert!(exported_xbns(&mut records).is_empty());
    }

    #[tokio::test]
    async fn data_blocks_rotate_by_age() {
        let config = DaqConfig {
            block_period: Duration::ZERO,
            ..DaqConfig::default()
        };
        let (manager, _records) = manager(config);
        let first = manager.new_block(AcquisitionState::Data);
        let second = manager.current_block();
        assert_ne!(first.xbn(), second.xbn());
        assert!(first.is_frozen());
        assert_eq!(second.state(), AcquisitionState::Data);

        let calibration = manager.new_block(AcquisitionState::Calibration);
        assert_eq!(manager.current_block().xbn(), calibration.xbn());
    }

    #[tokio::test]
    async fn blocks_snapshot_the_live_thresholds() {
        let (manager, _records) = manager(DaqConfig::default());
        manager.ctx.calibrator.set_l1_threshold(17.5);
        let block = manager.new_block(AcquisitionState::Data);
        manager.ctx.calibrator.set_l1_threshold(90.0);
        assert_eq!(block.l1_threshold(), 17.5);
        assert_eq!(block.l2_threshold(), 17);
        assert_eq!(block.run_id(), 42);
    }

    #[test]
    fn pass_rate_needs_a_full_window() {
        let monitor = PassRateMonitor::new(3);
        monitor.record(0);
        monitor.record(30_000_000_000);
        assert_eq!(monitor.rate_per_minute(), None);
        monitor.record(60_000_000_000);
        assert_eq!(monitor.rate_per_minute(), Some(2.0));
        monitor.clear();
        assert_eq!(monitor.rate_per_minute(), None);
    }
}
