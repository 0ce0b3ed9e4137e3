//! ---
//! ts_section: "11-simulation-test-harness"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Simulation runtime helpers and scenario engines."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
//! In-process stand-in for the motor controller. [`EmulatedDevice`] is the
//! synchronous protocol and physics core; [`Emulator`] drives it from a byte
//! stream with the controller's own timers.

pub mod device;
pub mod filter;
pub mod noise;
pub mod physics;
pub mod runtime;

/// Errors raised by the emulator runtime.
#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    #[error("invalid emulator configuration: {0}")]
    InvalidConfig(String),
    #[error("emulator stream failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode emulator reply: {0}")]
    Encode(#[from] trackside_proto::EncodeError),
}

pub use device::{EmulatedDevice, HandleOutcome};
pub use filter::MovingAverage;
pub use noise::NoiseGenerator;
pub use physics::{Disturbance, Drive, MotorModel, MotorState, Reading, NOMINAL_TICK};
pub use runtime::{Emulator, EmulatorHandle};
