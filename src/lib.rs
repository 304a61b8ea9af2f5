// THEORY:
// This file is the entry point of the `cosmic_trigger` library crate. It turns
// a camera sensor into a particle detector: every exposure runs through a
// cascade of cheap-to-expensive trigger stages, a rolling calibrator keeps the
// thresholds tuned to the sensor's noise floor, and results are grouped into
// numbered acquisition blocks for export.
//
// The high-level interface is `pipeline::DaqPipeline`. The building blocks live
// in `core_modules`, the worker pool and stage cascade in `parallel_pipeline`,
// and the seams to the surrounding application in `collaborators`.

pub mod collaborators;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
