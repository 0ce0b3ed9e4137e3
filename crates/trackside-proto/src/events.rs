//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Client-facing event and request envelopes."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::types::{Command, Telemetry};

/// Event published by the device session to every subscriber.
///
/// Wire form: `{"event":"status","data":{..}}` or `{"event":"input","data":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum LinkEvent {
    /// Connection status change or status reply.
    Status(StatusEvent),
    /// Telemetry relayed verbatim from the device.
    Input(Telemetry),
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Connection status as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusEvent {
    /// A session is confirmed open.
    pub open: bool,
    /// The last transition was caused by a failure.
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    /// Failure or informational message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Endpoint the session is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl StatusEvent {
    /// Session confirmed open on `endpoint`.
    pub fn opened(endpoint: impl Into<String>) -> Self {
        Self {
            open: true,
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Session closed normally.
    pub fn closed() -> Self {
        Self::default()
    }

    /// Session closed or never opened because of a failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            open: false,
            error: true,
            message: Some(message.into()),
            endpoint: None,
        }
    }

    /// Attach the endpoint identifier.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// One-way request sent by a client to the device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlRequest {
    /// Open `endpoint` (a serial port path, `TEST` or `emulator:<name>`).
    Open {
        /// Endpoint identifier.
        endpoint: String,
    },
    /// Close the active session.
    Close,
    /// Ask for the current status to be broadcast.
    Status,
    /// Write a command to the device.
    Command {
        /// Command to forward.
        command: Command,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_event_omits_unset_fields() {
        let event = LinkEvent::Status(StatusEvent::closed());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "status", "data": {"open": false}})
        );

        let event = LinkEvent::Status(StatusEvent::failed("no such port").with_endpoint("/dev/ttyX"));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "status", "data": {
                "open": false, "error": true, "message": "no such port", "endpoint": "/dev/ttyX"
            }})
        );
    }

    #[test]
    fn input_event_carries_telemetry_verbatim() {
        let raw = json!({"freeram": 1530, "dir": "b"});
        let telemetry = Telemetry::try_from(raw.clone()).unwrap();
        let event = serde_json::to_value(LinkEvent::Input(telemetry)).unwrap();
        assert_eq!(event, json!({"event": "input", "data": raw}));

        let back: LinkEvent = serde_json::from_value(event).unwrap();
        assert!(matches!(back, LinkEvent::Input(Telemetry::Heartbeat(_))));
    }

    #[test]
    fn control_requests_parse_from_wire() {
        let open: ControlRequest =
            serde_json::from_str(r#"{"op":"open","endpoint":"TEST"}"#).unwrap();
        assert_eq!(open, ControlRequest::Open { endpoint: "TEST".into() });

        let close: ControlRequest = serde_json::from_str(r#"{"op":"close"}"#).unwrap();
        assert_eq!(close, ControlRequest::Close);

        let command: ControlRequest =
            serde_json::from_str(r#"{"op":"command","command":{"speed":40}}"#).unwrap();
        assert_eq!(command, ControlRequest::Command { command: Command::Speed(40) });

        assert!(serde_json::from_str::<ControlRequest>(r#"{"op":"reboot"}"#).is_err());
    }
}
