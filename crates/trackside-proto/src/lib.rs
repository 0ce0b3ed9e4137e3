//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Message schema helpers and protocol codecs."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Newline-delimited JSON protocol spoken by the motor controller, plus the
//! event and request envelopes relayed to link clients.

pub mod codec;
pub mod events;
pub mod framing;
pub mod types;

/// Classification of inbound frames that could not be turned into telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The line was not a JSON object after sanitisation.
    MalformedFrame,
    /// Nothing was left after stripping non-printable bytes.
    EmptyFrame,
}

/// Error returned by [`codec::decode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct DecodeError {
    /// Failure classification.
    pub kind: DecodeErrorKind,
    /// Human readable detail, suitable for debug logs only.
    pub detail: String,
}

impl DecodeError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::MalformedFrame,
            detail: detail.into(),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            kind: DecodeErrorKind::EmptyFrame,
            detail: String::from("line empty after sanitisation"),
        }
    }

    /// True when the frame should be skipped silently.
    pub fn is_empty_frame(&self) -> bool {
        self.kind == DecodeErrorKind::EmptyFrame
    }
}

/// Error returned when a command cannot be serialised.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode command: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

pub use codec::{decode, encode, encode_line, sanitize};
pub use events::{ControlRequest, LinkEvent, StatusEvent};
pub use framing::{FramedLine, LineFramer, DEFAULT_MAX_LINE};
pub use types::{
    AccessoryCommand, AccessoryOp, Ack, Command, DeviceFault, DeviceQuery, Direction,
    DirectionReport, Heartbeat, ParamSetting, PidParams, PortFlag, PortsReport, RelayCommand,
    RelayCount, RelayOp, Sample, SelfTest, Telemetry, TurnoutCount, MAX_SPEED,
};
