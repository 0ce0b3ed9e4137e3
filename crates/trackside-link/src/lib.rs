//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Device session orchestration for the link daemon."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
//! Owns the single connection to the motor controller. [`SessionManager`] is
//! the entry point: it opens serial or emulated endpoints, confirms the link
//! from the inbound frame stream and fans telemetry out as [`LinkEvent`]s.
//!
//! [`LinkEvent`]: trackside_proto::LinkEvent

pub mod error;
pub mod manager;
pub mod session;
pub mod transport;

pub use error::LinkError;
pub use manager::SessionManager;
pub use session::{SessionSettings, SessionState, SessionStatus};
pub use transport::{Connection, Connector, DeviceConnector, DeviceIo, DynStream, Endpoint};
