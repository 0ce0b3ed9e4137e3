//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Network surfaces of the link daemon."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! HTTP and WebSocket endpoints exposing a [`SessionManager`] to clients.
//!
//! [`SessionManager`]: trackside_link::SessionManager

pub mod websocket;

pub use websocket::{WebSocketServerBuilder, WebSocketServerHandle};
