// THEORY:
// An `AcquisitionBlock` is the unit of accounting. Every frame is stamped with
// exactly one block when it enters the trigger, and the block is what finally
// gets exported: how long it ran, with which thresholds, how many frames each
// stage saw, passed and skipped, and the events that survived the whole chain.
//
// Key architectural principles:
// 1.  **Snapshotted at creation**: state, thresholds, location and battery
//     temperature are copied in when the block is made and never change, so
//     everything inside a block was held to the same rules.
// 2.  **The block owns its chain**: each block builds its own trigger chain for
//     its state. The chain's counters are therefore the block's per-stage
//     counters, and a rotation starts counting from zero without any reset.
// 3.  **Finalized means drained**: a frozen block keeps running frames it
//     already accepted. It is complete only when every assigned frame has been
//     cleared back to it.
// 4.  **Events only in DATA**: outside DATA a frame's payload is discarded on
//     clear, zero-bias squares included.

use crate::core_modules::calibrator::Thresholds;
use crate::core_modules::frame::{AcquisitionTime, FrameBuffer, GeoLocation, INTENSITY_LEVELS};
use crate::core_modules::histogram::Histogram;
use crate::core_modules::l0_zero_bias::ZeroBiasSquare;
use crate::core_modules::l2_reco::CandidatePixel;
use crate::core_modules::state_machine::AcquisitionState;
use crate::error::BlockError;
use crate::parallel_pipeline::TriggerChain;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Everything a block copies in when it is created.
#[derive(Debug, Clone)]
pub struct BlockParams {
    pub xbn: u64,
    pub run_id: u64,
    pub state: AcquisitionState,
    pub thresholds: Thresholds,
    pub start_location: Option<GeoLocation>,
    pub battery_start: Option<f32>,
    pub resolution: (u32, u32),
}

/// One accepted frame, ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub xbn: u64,
    pub frame_id: u64,
    pub acquired: AcquisitionTime,
    pub location: Option<GeoLocation>,
    pub orientation: Option<[f32; 3]>,
    pub pressure: Option<f32>,
    pub zero_bias: Option<ZeroBiasSquare>,
    pub pixels: Vec<CandidatePixel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub config: String,
    pub processed: u64,
    pub pass: u64,
    pub skip: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub xbn: u64,
    pub run_id: u64,
    pub state: AcquisitionState,
    pub start_time: AcquisitionTime,
    pub end_time: Option<AcquisitionTime>,
    pub thresholds: Thresholds,
    pub start_location: Option<GeoLocation>,
    pub battery_start: Option<f32>,
    pub battery_end: Option<f32>,
    pub resolution: (u32, u32),
    pub frozen: bool,
    pub aborted: bool,
    pub assigned: u64,
    pub cleared: u64,
    pub dropped_pixels: u64,
    pub stages: Vec<StageSummary>,
    /// Per-intensity pixel counts below the L1 threshold, DATA only.
    pub pixel_histogram: Vec<i64>,
    pub events: Vec<CandidateEvent>,
}

/// The last few accepted events across blocks, for display.
pub struct RecentEvents {
    capacity: usize,
    events: Mutex<VecDeque<CandidateEvent>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, event: CandidateEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<CandidateEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

pub struct AcquisitionBlock {
    xbn: u64,
    run_id: u64,
    state: AcquisitionState,
    thresholds: Thresholds,
    start_time: AcquisitionTime,
    end_time: Mutex<Option<AcquisitionTime>>,
    start_location: Option<GeoLocation>,
    battery_start: Option<f32>,
    battery_end: Mutex<Option<f32>>,
    resolution: (u32, u32),
    chain: TriggerChain,
    frozen: AtomicBool,
    aborted: AtomicBool,
    assigned: AtomicU64,
    cleared: AtomicU64,
    dropped_pixels: AtomicU64,
    pixel_histogram: Mutex<Histogram>,
    events: Mutex<Vec<CandidateEvent>>,
    recent: Arc<RecentEvents>,
}

impl AcquisitionBlock {
    pub fn new(params: BlockParams, chain: TriggerChain, recent: Arc<RecentEvents>) -> Self {
        let bins = (params.thresholds.l1.max(0.0).ceil() as usize + 1).min(INTENSITY_LEVELS);
        Self {
            xbn: params.xbn,
            run_id: params.run_id,
            state: params.state,
            thresholds: params.thresholds,
            start_time: AcquisitionTime::now(0),
            end_time: Mutex::new(None),
            start_location: params.start_location,
            battery_start: params.battery_start,
            battery_end: Mutex::new(None),
            resolution: params.resolution,
            chain,
            frozen: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            assigned: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
            dropped_pixels: AtomicU64::new(0),
            pixel_histogram: Mutex::new(Histogram::new(bins)),
            events: Mutex::new(Vec::new()),
            recent,
        }
    }

    pub fn xbn(&self) -> u64 {
        self.xbn
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn l1_threshold(&self) -> f64 {
        self.thresholds.l1
    }

    pub fn l2_threshold(&self) -> u8 {
        self.thresholds.l2
    }

    pub fn start_time(&self) -> AcquisitionTime {
        self.start_time
    }

    pub fn end_time(&self) -> Option<AcquisitionTime> {
        *self.end_time.lock()
    }

    pub fn chain(&self) -> &TriggerChain {
        &self.chain
    }

    /// Stamps `frame` with this block and counts it. Frozen blocks take no new
    /// frames.
    pub fn try_assign(self: &Arc<Self>, frame: &FrameBuffer) -> Result<(), BlockError> {
        if self.is_frozen() {
            return Err(BlockError::Frozen {
                xbn: self.xbn,
                frame_id: frame.id(),
            });
        }
        if !frame.stamp(self.clone()) {
            return Err(BlockError::AlreadyAssigned {
                xbn: self.xbn,
                frame_id: frame.id(),
            });
        }
        self.assigned.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Called by the frame itself once it is cleared.
    pub(crate) fn clear_frame(&self, frame: &FrameBuffer) {
        let payload = frame.take_payload();
        if self.state == AcquisitionState::Data && payload.upload_requested {
            let metadata = frame.metadata();
            let event = CandidateEvent {
                xbn: self.xbn,
                frame_id: frame.id(),
                acquired: metadata.acquired,
                location: metadata.location,
                orientation: metadata.orientation,
                pressure: metadata.pressure,
                zero_bias: payload.zero_bias,
                pixels: payload.pixels,
            };
            self.recent.push(event.clone());
            self.events.lock().push(event);
        }
        self.cleared.fetch_add(1, Ordering::AcqRel);
    }

    /// Stops the block from taking new frames and stamps its end. Returns false
    /// if it was already frozen.
    pub fn freeze(&self, battery_end: Option<f32>) -> bool {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.end_time.lock() = Some(AcquisitionTime::now(0));
        *self.battery_end.lock() = battery_end;
        log::debug!(
            "block {} ({:?}) frozen with {} frames assigned",
            self.xbn,
            self.state,
            self.assigned()
        );
        true
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn assigned(&self) -> u64 {
        self.assigned.load(Ordering::Acquire)
    }

    pub fn cleared(&self) -> u64 {
        self.cleared.load(Ordering::Acquire)
    }

    /// Frames assigned but not yet cleared.
    pub fn outstanding(&self) -> u64 {
        self.assigned().saturating_sub(self.cleared())
    }

    pub fn is_finalized(&self) -> bool {
        self.is_frozen() && self.outstanding() == 0
    }

    pub fn fill_pixel_histogram(&self, levels: &[u32]) {
        let mut histogram = self.pixel_histogram.lock();
        for (level, &count) in levels.iter().enumerate() {
            if count > 0 {
                histogram.fill_weighted(level as i64, count as i64);
            }
        }
    }

    pub fn add_dropped_pixels(&self, count: u64) {
        self.dropped_pixels.fetch_add(count, Ordering::AcqRel);
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            xbn: self.xbn,
            run_id: self.run_id,
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time(),
            thresholds: self.thresholds,
            start_location: self.start_location,
            battery_start: self.battery_start,
            battery_end: *self.battery_end.lock(),
            resolution: self.resolution,
            frozen: self.is_frozen(),
            aborted: self.is_aborted(),
            assigned: self.assigned(),
            cleared: self.cleared(),
            dropped_pixels: self.dropped_pixels.load(Ordering::Acquire),
            stages: self.chain.summaries(),
            pixel_histogram: self.pixel_histogram.lock().values().to_vec(),
            events: self.events.lock().clone(),
        }
    }
}
