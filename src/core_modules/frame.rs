// THEORY:
// A `FrameBuffer` is one sensor exposure travelling through the trigger. The
// memory behind it belongs to the camera: a small, fixed set of sensor slots
// that the camera wants back as quickly as possible. The frame therefore walks a
// strict, monotonic lifecycle:
//
//     Fresh -> Weighted -> Claimed -> Retired -> Cleared
//
// Key architectural principles:
// 1.  **The slot lease is the back-pressure point**: the camera acquires a
//     `SlotLease` before it writes a new exposure, and the frame holds it until
//     it is either claimed (its weighted plane copied into private memory) or
//     retired. A slow consumer therefore stalls slot reuse and never tears data.
// 2.  **Statistics exactly once**: weighting and the peak/mean/std reduction run
//     at most once per frame behind a dedicated guard with a double-checked
//     `OnceLock`. Every stage reads the same cached numbers.
// 3.  **Claim is idempotent and fallible**: a second claim is a no-op. A claim
//     that cannot allocate releases the slot and reports `OutOfMemory`, so the
//     caller drops one frame instead of the process.
// 4.  **One frame type, pluggable acquisition**: how raw bytes reach the slot
//     (`RawPlaneSource`) and how they are weighted (`PixelWeighting`) are
//     strategies the camera picks once at startup.

use crate::core_modules::acquisition_block::AcquisitionBlock;
use crate::core_modules::l0_zero_bias::ZeroBiasSquare;
use crate::core_modules::l2_reco::CandidatePixel;
use crate::error::FrameError;
use image::GrayImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Number of intensity levels in an 8-bit plane.
pub const INTENSITY_LEVELS: usize = 256;

/// Nanoseconds since the first call in this process. Used as the monotonic clock
/// for every timestamp the trigger compares.
pub fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// A point in time on the three clocks an acquisition cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionTime {
    /// Device wall clock, ms since the Unix epoch.
    pub wall_ms: i64,
    /// Process-monotonic clock, ns.
    pub nanos: u64,
    /// Network-corrected wall clock, ms since the Unix epoch.
    pub ntp_ms: i64,
}

impl AcquisitionTime {
    pub fn now(ntp_offset_ms: i64) -> Self {
        let wall_ms = chrono::Utc::now().timestamp_millis();
        Self {
            wall_ms,
            nanos: monotonic_nanos(),
            ntp_ms: wall_ms + ntp_offset_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f32>,
    pub fix_time_ms: i64,
}

/// Everything the camera knows about an exposure besides its pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub acquired: AcquisitionTime,
    /// Azimuth, pitch and roll in radians.
    pub orientation: Option<[f32; 3]>,
    /// Cosine between the device z-axis (out of the screen) and gravity: +1 when
    /// the device lies screen-down, -1 screen-up.
    pub rotation_zz: Option<f32>,
    pub location: Option<GeoLocation>,
    pub pressure: Option<f32>,
    pub facing_back: bool,
    pub camera_id: u32,
}

/// One reusable piece of sensor memory.
pub struct SensorSlot {
    index: usize,
    plane: RwLock<GrayImage>,
    guard: Arc<Semaphore>,
}

/// The camera-owned set of sensor slots, handed out one exposure at a time.
pub struct SensorBufferPool {
    slots: Vec<Arc<SensorSlot>>,
    next_slot: AtomicUsize,
    next_frame_id: AtomicU64,
}

impl SensorBufferPool {
    pub fn new(slots: usize, width: u32, height: u32) -> Self {
        let slots = (0..slots.max(1))
            .map(|index| {
                Arc::new(SensorSlot {
                    index,
                    plane: RwLock::new(GrayImage::new(width, height)),
                    guard: Arc::new(Semaphore::new(1)),
                })
            })
            .collect();
        Self {
            slots,
            next_slot: AtomicUsize::new(0),
            next_frame_id: AtomicU64::new(0),
        }
    }

    /// Waits until the next slot in rotation is released by its frame.
    pub async fn acquire(&self) -> Option<SlotLease> {
        let index = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = self.slots[index].clone();
        let permit = slot.guard.clone().acquire_owned().await.ok()?;
        Some(self.lease(slot, permit))
    }

    /// Takes any free slot without waiting.
    pub fn try_acquire(&self) -> Option<SlotLease> {
        self.slots.iter().find_map(|slot| {
            let permit = slot.guard.clone().try_acquire_owned().ok()?;
            Some(self.lease(slot.clone(), permit))
        })
    }

    /// Slots not currently leased to a frame.
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.guard.available_permits())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn lease(&self, slot: Arc<SensorSlot>, permit: OwnedSemaphorePermit) -> SlotLease {
        SlotLease {
            slot,
            frame_id: self.next_frame_id.fetch_add(1, Ordering::Relaxed),
            _permit: permit,
        }
    }
}

/// Exclusive right to a sensor slot. Dropping it hands the slot back to the camera.
pub struct SlotLease {
    slot: Arc<SensorSlot>,
    frame_id: u64,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn slot_index(&self) -> usize {
        self.slot.index
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.slot.plane.read().dimensions()
    }

    /// Copies raw samples into the slot. Extra bytes are ignored, missing ones
    /// leave the previous contents in place.
    pub fn write_raw(&self, bytes: &[u8]) {
        let mut plane = self.slot.plane.write();
        let raw: &mut [u8] = &mut plane;
        let n = raw.len().min(bytes.len());
        raw[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn with_plane_mut<R>(&self, f: impl FnOnce(&mut GrayImage) -> R) -> R {
        f(&mut self.slot.plane.write())
    }
}

/// How the raw exposure reaches the slot.
pub trait RawPlaneSource: Send + Sync {
    fn read_into(&self, plane: &mut GrayImage) -> Result<(), String>;
}

/// The camera already wrote the exposure straight into the slot.
pub struct SlotResident;

impl RawPlaneSource for SlotResident {
    fn read_into(&self, _plane: &mut GrayImage) -> Result<(), String> {
        Ok(())
    }
}

/// The exposure arrived as a separate byte buffer and is copied in lazily.
pub struct ByteSource(pub Vec<u8>);

impl RawPlaneSource for ByteSource {
    fn read_into(&self, plane: &mut GrayImage) -> Result<(), String> {
        if self.0.len() != plane.len() {
            return Err(format!(
                "expected {} raw bytes, got {}",
                plane.len(),
                self.0.len()
            ));
        }
        plane.copy_from_slice(&self.0);
        Ok(())
    }
}

/// Per-pixel weighting applied in place before statistics are taken.
pub trait PixelWeighting: Send + Sync {
    fn apply(&self, plane: &mut GrayImage);
}

/// A byte budget for claimed planes. Charges are returned when the owning
/// frame is cleared.
#[derive(Debug)]
pub struct ClaimBudget {
    limit: usize,
    used: AtomicUsize,
}

impl ClaimBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn try_charge(self: &Arc<Self>, bytes: usize) -> Option<ClaimCharge> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .ok()?;
        Some(ClaimCharge {
            budget: self.clone(),
            bytes,
        })
    }
}

struct ClaimCharge {
    budget: Arc<ClaimBudget>,
    bytes: usize,
}

impl Drop for ClaimCharge {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

struct ClaimedPlane {
    plane: GrayImage,
    _charge: Option<ClaimCharge>,
}

/// Scalar reduction of the weighted plane.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStatistics {
    pub peak: u8,
    pub mean: f64,
    pub std_dev: f64,
    /// Pixel count per intensity level.
    pub histogram: Vec<u32>,
}

impl FrameStatistics {
    pub fn from_plane(plane: &GrayImage) -> Self {
        let mut histogram = vec![0u32; INTENSITY_LEVELS];
        for &value in plane.as_raw() {
            histogram[value as usize] += 1;
        }
        let n: u64 = histogram.iter().map(|&c| c as u64).sum();
        if n == 0 {
            return Self {
                peak: 0,
                mean: 0.0,
                std_dev: 0.0,
                histogram,
            };
        }
        let peak = histogram.iter().rposition(|&c| c > 0).unwrap_or(0) as u8;
        let sum: f64 = histogram
            .iter()
            .enumerate()
            .map(|(v, &c)| v as f64 * c as f64)
            .sum();
        let mean = sum / n as f64;
        let var: f64 = histogram
            .iter()
            .enumerate()
            .map(|(v, &c)| (v as f64 - mean).powi(2) * c as f64)
            .sum::<f64>()
            / n as f64;
        Self {
            peak,
            mean,
            std_dev: var.sqrt(),
            histogram,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FrameState {
    Fresh = 0,
    Weighted = 1,
    Claimed = 2,
    Retired = 3,
    Cleared = 4,
}

impl FrameState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FrameState::Fresh,
            1 => FrameState::Weighted,
            2 => FrameState::Claimed,
            3 => FrameState::Retired,
            _ => FrameState::Cleared,
        }
    }
}

/// What the trigger stages attach to a frame for export.
#[derive(Debug, Clone, Default)]
pub struct EventPayload {
    pub zero_bias: Option<ZeroBiasSquare>,
    pub pixels: Vec<CandidatePixel>,
    pub upload_requested: bool,
}

pub struct FrameBuffer {
    id: u64,
    width: u32,
    height: u32,
    metadata: FrameMetadata,
    state: AtomicU8,
    lease: Mutex<Option<SlotLease>>,
    source: Mutex<Option<Box<dyn RawPlaneSource>>>,
    weighting: Option<Arc<dyn PixelWeighting>>,
    weighting_guard: Mutex<()>,
    statistics: OnceLock<FrameStatistics>,
    claimed: Mutex<Option<ClaimedPlane>>,
    budget: Option<Arc<ClaimBudget>>,
    block: OnceLock<Arc<AcquisitionBlock>>,
    payload: Mutex<EventPayload>,
}

impl FrameBuffer {
    pub fn builder(lease: SlotLease) -> FrameBuilder {
        FrameBuilder {
            lease,
            metadata: FrameMetadata::default(),
            source: None,
            weighting: None,
            budget: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the frame still reads from camera memory it has not copied out.
    pub fn is_outstanding(&self) -> bool {
        self.state() < FrameState::Claimed && self.lease.lock().is_some()
    }

    pub fn block(&self) -> Option<&Arc<AcquisitionBlock>> {
        self.block.get()
    }

    /// Tags the frame with its accounting block. Only the first stamp sticks.
    pub(crate) fn stamp(&self, block: Arc<AcquisitionBlock>) -> bool {
        self.block.set(block).is_ok()
    }

    /// Weights the plane and reduces it, once. Later calls return the cache.
    pub fn statistics(&self) -> Result<&FrameStatistics, FrameError> {
        if let Some(stats) = self.statistics.get() {
            return Ok(stats);
        }
        let _weighting = self.weighting_guard.lock();
        if let Some(stats) = self.statistics.get() {
            return Ok(stats);
        }

        let lease = self.lease.lock();
        let lease = lease.as_ref().ok_or(FrameError::PlaneReleased { frame_id: self.id })?;
        let mut plane = lease.slot.plane.write();
        if let Some(source) = self.source.lock().take() {
            source
                .read_into(&mut plane)
                .map_err(|reason| FrameError::SourceFailed {
                    frame_id: self.id,
                    reason,
                })?;
        }
        if let Some(weighting) = &self.weighting {
            weighting.apply(&mut plane);
        }
        let stats = FrameStatistics::from_plane(&plane);
        drop(plane);

        self.advance(FrameState::Weighted);
        Ok(self.statistics.get_or_init(|| stats))
    }

    /// Copies the weighted plane into frame-owned memory and hands the sensor
    /// slot back. Safe to call more than once.
    pub fn claim(&self) -> Result<(), FrameError> {
        let mut claimed = self.claimed.lock();
        if claimed.is_some() {
            return Ok(());
        }
        if self.state() >= FrameState::Retired {
            return Err(FrameError::PlaneReleased { frame_id: self.id });
        }
        if let Err(err) = self.statistics() {
            self.retire();
            return Err(err);
        }

        let mut lease = self.lease.lock();
        let copied = match lease.as_ref() {
            Some(lease) => self.copy_out(lease),
            None => Err(FrameError::PlaneReleased { frame_id: self.id }),
        };
        // Whatever happened, the slot goes back to the camera now.
        lease.take();
        drop(lease);

        match copied {
            Ok(plane) => {
                *claimed = Some(plane);
                self.advance(FrameState::Claimed);
                Ok(())
            }
            Err(err) => {
                self.source.lock().take();
                self.advance(FrameState::Retired);
                Err(err)
            }
        }
    }

    fn copy_out(&self, lease: &SlotLease) -> Result<ClaimedPlane, FrameError> {
        let plane = lease.slot.plane.read();
        let bytes = plane.len();
        let oom = FrameError::OutOfMemory {
            frame_id: self.id,
            bytes,
        };

        let charge = match &self.budget {
            Some(budget) => Some(budget.try_charge(bytes).ok_or_else(|| oom.clone())?),
            None => None,
        };
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| oom.clone())?;
        data.extend_from_slice(plane.as_raw());

        let plane = GrayImage::from_raw(plane.width(), plane.height(), data).ok_or_else(|| {
            FrameError::SourceFailed {
                frame_id: self.id,
                reason: "claimed plane does not match slot dimensions".to_string(),
            }
        })?;
        Ok(ClaimedPlane {
            plane,
            _charge: charge,
        })
    }

    /// Releases the sensor slot. Safe to call more than once.
    pub fn retire(&self) {
        self.lease.lock().take();
        self.source.lock().take();
        self.advance(FrameState::Retired);
    }

    /// Final step: reports the frame to its block and drops the planes.
    pub fn clear(&self) -> Result<(), FrameError> {
        let state = self.state();
        if state < FrameState::Retired {
            return Err(FrameError::ClearBeforeRetire {
                frame_id: self.id,
                state,
            });
        }
        let transitioned = self
            .state
            .compare_exchange(
                FrameState::Retired as u8,
                FrameState::Cleared as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            return Ok(());
        }

        if let Some(block) = self.block.get() {
            block.clear_frame(self);
        }
        self.claimed.lock().take();
        Ok(())
    }

    /// Runs `f` against the weighted plane, wherever it currently lives.
    pub fn with_plane<R>(&self, f: impl FnOnce(&GrayImage) -> R) -> Result<R, FrameError> {
        {
            let claimed = self.claimed.lock();
            if let Some(claimed) = claimed.as_ref() {
                return Ok(f(&claimed.plane));
            }
        }
        self.statistics()?;
        let lease = self.lease.lock();
        if let Some(lease) = lease.as_ref() {
            let plane = lease.slot.plane.read();
            return Ok(f(&plane));
        }
        drop(lease);

        // Claimed between the two checks above.
        let claimed = self.claimed.lock();
        claimed
            .as_ref()
            .map(|claimed| f(&claimed.plane))
            .ok_or(FrameError::PlaneReleased { frame_id: self.id })
    }

    pub fn set_zero_bias(&self, square: ZeroBiasSquare) {
        let mut payload = self.payload.lock();
        payload.zero_bias = Some(square);
        payload.upload_requested = true;
    }

    pub fn set_pixels(&self, pixels: Vec<CandidatePixel>) {
        let mut payload = self.payload.lock();
        payload.pixels = pixels;
        payload.upload_requested = true;
    }

    pub fn payload(&self) -> EventPayload {
        self.payload.lock().clone()
    }

    pub(crate) fn take_payload(&self) -> EventPayload {
        std::mem::take(&mut *self.payload.lock())
    }

    fn advance(&self, to: FrameState) {
        self.state.fetch_max(to as u8, Ordering::AcqRel);
    }
}

pub struct FrameBuilder {
    lease: SlotLease,
    metadata: FrameMetadata,
    source: Option<Box<dyn RawPlaneSource>>,
    weighting: Option<Arc<dyn PixelWeighting>>,
    budget: Option<Arc<ClaimBudget>>,
}

impl FrameBuilder {
    pub fn metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn acquired(mut self, acquired: AcquisitionTime) -> Self {
        self.metadata.acquired = acquired;
        self
    }

    pub fn raw_source(mut self, source: Box<dyn RawPlaneSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn weighting(mut self, weighting: Arc<dyn PixelWeighting>) -> Self {
        self.weighting = Some(weighting);
        self
    }

    pub fn claim_budget(mut self, budget: Arc<ClaimBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn build(self) -> FrameBuffer {
        let (width, height) = self.lease.dimensions();
        FrameBuffer {
            id: self.lease.frame_id(),
            width,
            height,
            metadata: self.metadata,
            state: AtomicU8::new(FrameState::Fresh as u8),
            lease: Mutex::new(Some(self.lease)),
            source: Mutex::new(self.source),
            weighting: self.weighting,
            weighting_guard: Mutex::new(()),
            statistics: OnceLock::new(),
            claimed: Mutex::new(None),
            budget: self.budget,
            block: OnceLock::new(),
            payload: Mutex::new(EventPayload::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        value: u8,
    }

    impl RawPlaneSource for CountingSource {
        fn read_into(&self, plane: &mut GrayImage) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for p in plane.pixels_mut() {
                *p = image::Luma([self.value]);
            }
            plane.put_pixel(1, 1, image::Luma([self.value + 10]));
            Ok(())
        }
    }

    fn frame_with(pool: &SensorBufferPool, calls: Arc<AtomicUsize>) -> FrameBuffer {
        let lease = pool.try_acquire().expect("free slot");
        FrameBuffer::builder(lease)
            .raw_source(Box::new(CountingSource { calls, value: 5 }))
            .build()
    }

    #[test]
    fn statistics_are_computed_once() {
        let pool = SensorBufferPool::new(1, 4, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let frame = frame_with(&pool, calls.clone());

        let first = frame.statistics().unwrap().clone();
        let second = frame.statistics().unwrap().clone();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.peak, 15);
        assert_eq!(first.histogram[5], 15);
        assert_eq!(frame.state(), FrameState::Weighted);
    }

    #[test]
    fn claim_is_idempotent() {
        let pool = SensorBufferPool::new(1, 8, 8);
        let budget = ClaimBudget::new(1 << 20);
        let lease = pool.try_acquire().unwrap();
        lease.write_raw(&[7u8; 64]);
        let frame = FrameBuffer::builder(lease)
            .raw_source(Box::new(SlotResident))
            .claim_budget(budget.clone())
            .build();
        assert_eq!(pool.available(), 0);
        assert!(frame.is_outstanding());

        frame.claim().unwrap();
        frame.claim().unwrap();

        assert_eq!(budget.in_use(), 64);
        assert_eq!(pool.available(), 1);
        assert!(!frame.is_outstanding());
        assert_eq!(frame.state(), FrameState::Claimed);

        frame.retire();
        frame.retire();
        assert_eq!(pool.available(), 1);
        frame.clear().unwrap();
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn claimed_plane_survives_slot_reuse() {
        let pool = SensorBufferPool::new(1, 2, 2);
        let lease = pool.try_acquire().unwrap();
        lease.write_raw(&[1, 2, 3, 4]);
        let frame = FrameBuffer::builder(lease).build();
        frame.claim().unwrap();

        let next = pool.try_acquire().expect("slot released by claim");
        next.write_raw(&[9, 9, 9, 9]);

        let pixels = frame.with_plane(|p| p.as_raw().clone()).unwrap();
        assert_eq!(pixels, vec![1, 2, 3, 4]);
    }

    #[test]
    fn claim_under_memory_pressure_releases_the_slot() {
        let pool = SensorBufferPool::new(1, 8, 8);
        let lease = pool.try_acquire().unwrap();
        let frame = FrameBuffer::builder(lease)
            .claim_budget(ClaimBudget::new(16))
            .build();

        let err = frame.claim().unwrap_err();
        assert!(matches!(err, FrameError::OutOfMemory { bytes: 64, .. }));
        assert_eq!(pool.available(), 1);
        assert_eq!(frame.state(), FrameState::Retired);
        assert!(frame.clear().is_ok());
    }

    #[test]
    fn clear_before_retire_is_rejected() {
        let pool = SensorBufferPool::new(1, 2, 2);
        let frame = FrameBuffer::builder(pool.try_acquire().unwrap()).build();

        let err = frame.clear().unwrap_err();
        assert!(matches!(err, FrameError::ClearBeforeRetire { state: FrameState::Fresh, .. }));

        frame.retire();
        assert!(frame.clear().is_ok());
        assert!(frame.clear().is_ok());
        assert_eq!(frame.state(), FrameState::Cleared);
    }

    #[test]
    fn mismatched_byte_source_is_reported() {
        let pool = SensorBufferPool::new(1, 4, 4);
        let frame = FrameBuffer::builder(pool.try_acquire().unwrap())
            .raw_source(Box::new(ByteSource(vec![0; 3])))
            .build();
        assert!(matches!(
            frame.statistics(),
            Err(FrameError::SourceFailed { .. })
        ));
    }
}
