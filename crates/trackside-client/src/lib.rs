//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Client facade over a link channel."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
//! [`LinkManager`] tracks connection state, throttles speed and PID edits and
//! memoises device facts. It talks to the daemon through a [`LinkChannel`]:
//! [`WsChannel`] for a remote `tracksided`, [`LocalChannel`] for an
//! in-process [`SessionManager`](trackside_link::SessionManager).

pub mod channel;
pub mod error;
pub mod manager;

pub use channel::{LinkChannel, LocalChannel, WsChannel};
pub use error::ClientError;
pub use manager::{Commands, LinkManager};
