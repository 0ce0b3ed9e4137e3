//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Error taxonomy of the device session."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use trackside_proto::EncodeError;

/// Errors surfaced by [`crate::SessionManager`]. None of them tear down an
/// open session; transport failures are reported as status events instead.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("invalid endpoint identifier `{0}`")]
    InvalidEndpoint(String),
    #[error("failed to open endpoint {endpoint}: {message}")]
    EndpointOpenFailure { endpoint: String, message: String },
    #[error("device session is not open")]
    NotOpen,
    #[error("device write queue is full")]
    WriteQueueFull,
    #[error("device writer has stopped")]
    ChannelClosed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
