// THEORY:
// `core_modules` holds the building blocks of the trigger, from the bottom up:
// histograms and the rolling sample window, the frame buffer and its
// ownership protocol, the calibrators, the individual trigger stages, and
// finally the acquisition blocks and the state machine that drive them.

pub mod histogram;
pub mod rolling_window;
pub mod frame;
pub mod trigger_config;
pub mod calibrator;
pub mod l0_zero_bias;
pub mod quality_gate;
pub mod l1_trigger;
pub mod l2_reco;
pub mod precalibration;
pub mod acquisition_block;
pub mod block_manager;
pub mod state_machine;
