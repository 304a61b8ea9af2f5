// THEORY:
// Errors are grouped by the lifecycle they guard. Resource exhaustion and
// lifecycle violations on a single frame live in `FrameError`; scheduling
// violations between stages live in `TriggerError`; accounting violations live
// in `BlockError`; and illegal phase changes live in `StateError`. The
// top-level `DaqError` simply wraps them so the public API has one type.
//
// Configuration problems never surface here: option parsing always falls back
// to a default and logs instead.

use crate::core_modules::frame::FrameState;
use crate::core_modules::state_machine::AcquisitionState;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// Copying the weighted plane out of the sensor slot could not allocate.
    #[error("out of memory while claiming frame {frame_id} ({bytes} bytes)")]
    OutOfMemory { frame_id: u64, bytes: usize },

    /// The sensor slot was already released and the frame holds no private copy.
    #[error("frame {frame_id} no longer has access to its intensity plane")]
    PlaneReleased { frame_id: u64 },

    #[error("frame {frame_id} cleared while still {state:?}; retire() must come first")]
    ClearBeforeRetire { frame_id: u64, state: FrameState },

    #[error("raw plane source failed for frame {frame_id}: {reason}")]
    SourceFailed { frame_id: u64, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TriggerError {
    #[error("frame {frame_id} is still outstanding when handed to the {stage} stage")]
    FrameOutstanding { frame_id: u64, stage: &'static str },

    #[error("frame {frame_id} reached a trigger stage without an acquisition block")]
    Untagged { frame_id: u64 },

    #[error("the worker pool has shut down")]
    PoolClosed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlockError {
    #[error("block {xbn} is frozen and cannot accept frame {frame_id}")]
    Frozen { xbn: u64, frame_id: u64 },

    #[error("frame {frame_id} already belongs to another block than {xbn}")]
    AlreadyAssigned { xbn: u64, frame_id: u64 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: AcquisitionState,
        to: AcquisitionState,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DaqError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    State(#[from] StateError),
}
