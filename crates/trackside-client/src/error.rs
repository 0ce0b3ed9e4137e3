//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Client error taxonomy."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use trackside_control::ControlError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("unsupported command `{0}`")]
    UnsupportedCommand(String),
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: u32 },
    #[error("link channel closed")]
    ChannelClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Control(#[from] ControlError),
}
