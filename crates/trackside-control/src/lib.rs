//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Delivery guarantees for device commands."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Rate limiting and acknowledgement tracking for commands sent to the
//! controller. [`Throttle`] is the pure state machine; [`Governor`] runs it
//! on a task against a [`CommandSink`].

pub mod governor;
pub mod throttle;

/// Errors surfaced by the control layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The retry budget ran out without a positive acknowledgement.
    #[error("no acknowledgement for `{cmd}` after {attempts} attempts")]
    CommandTimeout {
        /// Command name.
        cmd: String,
        /// Transmissions made.
        attempts: u8,
    },
    /// The governor task or its sink is gone.
    #[error("command channel closed")]
    ChannelClosed,
    /// The sink refused the command.
    #[error("failed to deliver command: {0}")]
    Delivery(String),
}

pub use governor::{CommandSink, Governor};
pub use throttle::{Outcome, Throttle, ThrottlePolicy};
