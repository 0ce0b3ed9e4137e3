//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Endpoint parsing and transport construction (serial or emulator)."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;
use trackside_common::{AppConfig, EmulatorConfig};
use trackside_sim::{Emulator, EmulatorHandle};

use crate::LinkError;

/// Identifier that selects the in-process emulator.
pub const TEST_ENDPOINT: &str = "TEST";
const EMULATOR_PREFIX: &str = "emulator:";

pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceIo for T {}
pub type DynStream = Box<dyn DeviceIo>;

/// Where the controller lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// In-process emulator (`TEST` or `emulator:<name>`).
    Emulator(String),
    /// Serial port path, e.g. `/dev/ttyACM0` or `COM3`.
    Serial(String),
}

impl Endpoint {
    pub fn id(&self) -> &str {
        match self {
            Endpoint::Emulator(id) | Endpoint::Serial(id) => id,
        }
    }

    pub fn is_emulated(&self) -> bool {
        matches!(self, Endpoint::Emulator(_))
    }
}

impl FromStr for Endpoint {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        if id.is_empty() {
            return Err(LinkError::InvalidEndpoint(s.to_string()));
        }
        if id == TEST_ENDPOINT || id.starts_with(EMULATOR_PREFIX) {
            Ok(Endpoint::Emulator(id.to_string()))
        } else {
            Ok(Endpoint::Serial(id.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// An opened transport. Emulated endpoints carry the emulator task so the
/// session can stop its timers on close.
pub struct Connection {
    pub stream: DynStream,
    pub emulator: Option<EmulatorHandle>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("emulated", &self.emulator.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, LinkError>;
}

/// Production connector: serial ports at the configured baud rate (8N1, no
/// flow control) or an emulator over an in-memory duplex pipe.
#[derive(Debug, Clone)]
pub struct DeviceConnector {
    baud_rate: u32,
    emulator: EmulatorConfig,
}

impl DeviceConnector {
    pub fn new(baud_rate: u32, emulator: EmulatorConfig) -> Self {
        Self {
            baud_rate,
            emulator,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.link.baud_rate, config.emulator.clone())
    }

    fn open_serial(&self, path: &str) -> Result<DynStream, LinkError> {
        let port = tokio_serial::new(path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|err| LinkError::EndpointOpenFailure {
                endpoint: path.to_string(),
                message: err.to_string(),
            })?;
        Ok(Box::new(port))
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, LinkError> {
        match endpoint {
            Endpoint::Emulator(id) => {
                let (stream, handle) = Emulator::duplex(self.emulator.clone()).map_err(|err| {
                    LinkError::EndpointOpenFailure {
                        endpoint: id.clone(),
                        message: err.to_string(),
                    }
                })?;
                info!(endpoint = %id, "emulated controller attached");
                Ok(Connection {
                    stream: Box::new(stream),
                    emulator: Some(handle),
                })
            }
            Endpoint::Serial(path) => {
                let stream = self.open_serial(path)?;
                info!(endpoint = %path, baud = self.baud_rate, "serial port opened");
                Ok(Connection {
                    stream,
                    emulator: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_identifiers() {
        assert_eq!(
            "TEST".parse::<Endpoint>().unwrap(),
            Endpoint::Emulator("TEST".into())
        );
        assert!("emulator:bench".parse::<Endpoint>().unwrap().is_emulated());
        assert_eq!(
            " /dev/ttyACM0 ".parse::<Endpoint>().unwrap(),
            Endpoint::Serial("/dev/ttyACM0".into())
        );
        assert!(matches!(
            "  ".parse::<Endpoint>(),
            Err(LinkError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn missing_serial_port_fails_to_open() {
        let connector = DeviceConnector::new(9600, EmulatorConfig::default());
        let endpoint = Endpoint::Serial("/dev/trackside-does-not-exist".into());
        let err = connector.connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, LinkError::EndpointOpenFailure { .. }));
    }

    #[tokio::test]
    async fn emulator_endpoint_attaches_emulator() {
        let connector = DeviceConnector::new(9600, EmulatorConfig::default());
        let connection = connector
            .connect(&Endpoint::Emulator("TEST".into()))
            .await
            .unwrap();
        let handle = connection.emulator.expect("emulator handle");
        handle.shutdown().await;
    }
}
