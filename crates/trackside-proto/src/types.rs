//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Typed commands and telemetry records of the device protocol."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};

/// Highest speed percentage accepted by the controller.
pub const MAX_SPEED: u8 = 100;

/// Travel direction of the locomotive motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Drive forwards.
    #[serde(rename = "f")]
    Forward,
    /// Drive backwards.
    #[serde(rename = "b")]
    Backward,
    /// Ramp down and hold.
    #[serde(rename = "s")]
    Stop,
}

impl Direction {
    /// Wire representation (`f`, `b` or `s`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "f",
            Direction::Backward => "b",
            Direction::Stop => "s",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f" | "fwd" | "forward" => Ok(Direction::Forward),
            "b" | "bck" | "back" | "backward" => Ok(Direction::Backward),
            "s" | "stop" => Ok(Direction::Stop),
            other => Err(format!("unknown direction `{other}`")),
        }
    }
}

/// PID controller parameters, as sent with `pid` and reported for `get pid`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParams {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
    /// Controller sample period in milliseconds.
    #[serde(rename = "sample")]
    pub sample_ms: u32,
}

impl PidParams {
    /// Construct a parameter set.
    pub fn new(kp: f64, ki: f64, kd: f64, sample_ms: u32) -> Self {
        Self {
            kp,
            ki,
            kd,
            sample_ms,
        }
    }
}

/// Parameters that can be read back with a `get` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceQuery {
    /// PID parameter set.
    Pid,
    /// Number of turnout decoders.
    Turnouts,
    /// Number of relays.
    Relays,
    /// Power-on self test verdict.
    Post,
    /// Accessory port connection map.
    Ports,
    /// Turnout pulse length in milliseconds.
    Accp,
    /// Maximum accessory on-time in milliseconds.
    Accm,
    /// Telemetry update period in milliseconds.
    Updt,
}

impl DeviceQuery {
    /// Wire representation of the query.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceQuery::Pid => "pid",
            DeviceQuery::Turnouts => "turnouts",
            DeviceQuery::Relays => "relays",
            DeviceQuery::Post => "post",
            DeviceQuery::Ports => "ports",
            DeviceQuery::Accp => "accp",
            DeviceQuery::Accm => "accm",
            DeviceQuery::Updt => "updt",
        }
    }
}

impl FromStr for DeviceQuery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.trim().to_ascii_lowercase()))
            .map_err(|_| format!("unknown device parameter `{s}`"))
    }
}

/// Writable device parameter with its new value. Wire form `{"updt":300}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamSetting {
    /// Telemetry update period in milliseconds.
    Updt(u32),
    /// Turnout pulse length in milliseconds.
    Accp(u32),
    /// Maximum accessory on-time in milliseconds.
    Accm(u32),
}

impl ParamSetting {
    /// Build a setting from its wire name.
    pub fn from_name(name: &str, value: u32) -> Option<Self> {
        match name {
            "updt" => Some(ParamSetting::Updt(value)),
            "accp" => Some(ParamSetting::Accp(value)),
            "accm" => Some(ParamSetting::Accm(value)),
            _ => None,
        }
    }

    /// Wire name of the parameter.
    pub fn name(&self) -> &'static str {
        match self {
            ParamSetting::Updt(_) => "updt",
            ParamSetting::Accp(_) => "accp",
            ParamSetting::Accm(_) => "accm",
        }
    }

    /// Carried value.
    pub fn value(&self) -> u32 {
        match self {
            ParamSetting::Updt(v) | ParamSetting::Accp(v) | ParamSetting::Accm(v) => *v,
        }
    }
}

/// Operation applied to a turnout output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessoryOp {
    /// Pulse the output for the configured pulse length.
    #[serde(rename = "p")]
    Pulse,
    /// Switch on (bounded by the max on-time).
    #[serde(rename = "on")]
    On,
    /// Switch off.
    #[serde(rename = "off")]
    Off,
}

impl FromStr for AccessoryOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p" | "pulse" => Ok(AccessoryOp::Pulse),
            "on" => Ok(AccessoryOp::On),
            "off" => Ok(AccessoryOp::Off),
            other => Err(format!("unknown accessory operation `{other}`")),
        }
    }
}

/// Turnout/accessory actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryCommand {
    /// Decoder address, 1-based.
    pub id: u16,
    /// Output port on the decoder (0 or 1).
    pub port: u8,
    /// Requested operation.
    pub cmd: AccessoryOp,
}

/// Relay switching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayOp {
    /// Energise the relay.
    On,
    /// Release the relay.
    Off,
}

impl FromStr for RelayOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(RelayOp::On),
            "off" => Ok(RelayOp::Off),
            other => Err(format!("unknown relay operation `{other}`")),
        }
    }
}

/// Relay actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    /// Relay address, 1-based.
    pub id: u16,
    /// Requested operation.
    pub cmd: RelayOp,
}

/// Outbound command. Serialises to a JSON object with a single top-level key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Change direction or stop.
    Dir(Direction),
    /// Speed percentage, 0..=100.
    Speed(u8),
    /// Replace the PID parameter set.
    Pid(PidParams),
    /// Read back a device parameter.
    Get(DeviceQuery),
    /// Write a device parameter.
    Set(ParamSetting),
    /// Actuate a turnout output.
    Acc(AccessoryCommand),
    /// Switch a relay.
    Rel(RelayCommand),
}

impl Command {
    /// Top-level keys of every command, in protocol order.
    pub const NAMES: [&'static str; 7] = ["dir", "speed", "pid", "get", "set", "acc", "rel"];

    /// Name used to match acknowledgements (`{"ack":..,"cmd":name}`).
    pub fn name(&self) -> &'static str {
        match self {
            Command::Dir(_) => "dir",
            Command::Speed(_) => "speed",
            Command::Pid(_) => "pid",
            Command::Get(_) => "get",
            Command::Set(_) => "set",
            Command::Acc(_) => "acc",
            Command::Rel(_) => "rel",
        }
    }

    /// Speed command with the percentage clamped to the protocol range.
    pub fn speed(percent: u8) -> Self {
        Command::Speed(percent.min(MAX_SPEED))
    }

    /// Direction forward.
    pub fn forward() -> Self {
        Command::Dir(Direction::Forward)
    }

    /// Direction backward.
    pub fn backward() -> Self {
        Command::Dir(Direction::Backward)
    }

    /// Stop.
    pub fn stop() -> Self {
        Command::Dir(Direction::Stop)
    }

    /// True for `{"dir":"s"}`.
    pub fn is_stop(&self) -> bool {
        matches!(self, Command::Dir(Direction::Stop))
    }
}

/// Periodic motor sample. `dir` and `freeram` are piggybacked by some firmware builds.
///
/// Analog readings keep their wire number representation (integer or float)
/// so the record relays unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Filtered back-EMF in millivolts.
    pub bemf: Number,
    /// PID setpoint in millivolts.
    pub target: Number,
    /// Current PWM duty (0..800).
    pub rate: i64,
    /// Filtered motor current in milliamperes.
    pub current: Number,
    /// Direction, when piggybacked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<Direction>,
    /// Free controller memory, when piggybacked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeram: Option<u32>,
}

impl Sample {
    /// Sample without piggybacked fields.
    pub fn new(bemf_mv: i64, target_mv: i64, rate: i64, current_ma: i64) -> Self {
        Self {
            bemf: bemf_mv.into(),
            target: target_mv.into(),
            rate,
            current: current_ma.into(),
            dir: None,
            freeram: None,
        }
    }

    /// Back-EMF in millivolts.
    pub fn bemf_mv(&self) -> f64 {
        self.bemf.as_f64().unwrap_or_default()
    }

    /// Setpoint in millivolts.
    pub fn target_mv(&self) -> f64 {
        self.target.as_f64().unwrap_or_default()
    }

    /// Motor current in milliamperes.
    pub fn current_ma(&self) -> f64 {
        self.current.as_f64().unwrap_or_default()
    }
}

/// Liveness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Free controller memory in bytes.
    pub freeram: u32,
    /// Current direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<Direction>,
}

/// Lone direction report (also what the firmware echoes for a `dir` command).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionReport {
    /// Reported direction.
    pub dir: Direction,
}

/// Acknowledgement of a processed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the command was accepted.
    #[serde(rename = "ack")]
    pub ok: bool,
    /// Name of the acknowledged command.
    pub cmd: String,
}

/// Power-on self test verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTest {
    /// `PASS` or `FAIL`.
    pub post: String,
    /// Failure detail reported by the firmware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
}

impl SelfTest {
    /// True when the controller reported `PASS`.
    pub fn passed(&self) -> bool {
        self.post.eq_ignore_ascii_case("PASS")
    }
}

/// One entry of the accessory port map; firmware builds send either booleans or 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortFlag {
    /// Boolean form.
    Flag(bool),
    /// Numeric form.
    Level(i64),
}

impl PortFlag {
    /// True when the port reports a connected accessory.
    pub fn is_set(&self) -> bool {
        match self {
            PortFlag::Flag(flag) => *flag,
            PortFlag::Level(level) => *level != 0,
        }
    }
}

/// Accessory port connection map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsReport {
    /// One flag per port.
    pub ports: Vec<PortFlag>,
}

/// Number of turnout decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnoutCount {
    /// Count.
    pub turnouts: u16,
}

/// Number of relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCount {
    /// Count.
    pub relays: u16,
}

/// Firmware-side parse failure, e.g. `{"error":"json"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFault {
    /// Failure code.
    pub error: String,
}

/// Inbound record, classified by key presence.
///
/// Serialises back to the exact wire object, so it can be relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Telemetry {
    /// Periodic motor sample.
    Sample(Sample),
    /// Direction report or `dir` echo.
    Direction(DirectionReport),
    /// Liveness report.
    Heartbeat(Heartbeat),
    /// Command acknowledgement.
    Ack(Ack),
    /// Self test verdict.
    SelfTest(SelfTest),
    /// Accessory port map.
    Ports(PortsReport),
    /// Turnout count.
    Turnouts(TurnoutCount),
    /// Relay count.
    Relays(RelayCount),
    /// Reply to `get accp|accm|updt`.
    Param(ParamSetting),
    /// Reply to `get pid`.
    Pid(PidParams),
    /// Echo of a received command.
    Echo(Command),
    /// Firmware could not parse a command.
    DeviceError(DeviceFault),
    /// Well-formed object with unrecognised keys.
    Other(Map<String, Value>),
}

const SAMPLE_KEYS: &[&str] = &["bemf", "target", "rate", "current", "dir", "freeram"];
const PARAM_KEYS: &[&str] = &["accp", "accm", "updt"];

fn typed<T: DeserializeOwned>(map: &Map<String, Value>, allowed: &[&str]) -> Option<T> {
    if !map.keys().all(|key| allowed.contains(&key.as_str())) {
        return None;
    }
    serde_json::from_value(Value::Object(map.clone())).ok()
}

impl Telemetry {
    /// Classify a decoded JSON object. Objects that do not fit a typed record
    /// exactly become [`Telemetry::Other`].
    pub fn from_object(map: Map<String, Value>) -> Self {
        let has = |key: &str| map.contains_key(key);
        let classified = if has("ack") {
            typed(&map, &["ack", "cmd"]).map(Telemetry::Ack)
        } else if has("post") {
            typed(&map, &["post", "err"]).map(Telemetry::SelfTest)
        } else if has("bemf") {
            typed(&map, SAMPLE_KEYS).map(Telemetry::Sample)
        } else if has("freeram") {
            typed(&map, &["freeram", "dir"]).map(Telemetry::Heartbeat)
        } else if has("dir") {
            typed(&map, &["dir"]).map(Telemetry::Direction)
        } else if has("kp") {
            typed(&map, &["kp", "ki", "kd", "sample"]).map(Telemetry::Pid)
        } else if has("ports") {
            typed(&map, &["ports"]).map(Telemetry::Ports)
        } else if has("turnouts") {
            typed(&map, &["turnouts"]).map(Telemetry::Turnouts)
        } else if has("relays") {
            typed(&map, &["relays"]).map(Telemetry::Relays)
        } else if map.len() == 1 && PARAM_KEYS.iter().any(|&key| has(key)) {
            typed(&map, PARAM_KEYS).map(Telemetry::Param)
        } else if has("error") {
            typed(&map, &["error"]).map(Telemetry::DeviceError)
        } else if map.len() == 1 && Command::NAMES.iter().any(|&key| has(key)) {
            typed(&map, &Command::NAMES).map(Telemetry::Echo)
        } else {
            None
        };
        classified.unwrap_or(Telemetry::Other(map))
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Telemetry::Sample(_) => "sample",
            Telemetry::Direction(_) => "direction",
            Telemetry::Heartbeat(_) => "heartbeat",
            Telemetry::Ack(_) => "ack",
            Telemetry::SelfTest(_) => "self_test",
            Telemetry::Ports(_) => "ports",
            Telemetry::Turnouts(_) => "turnouts",
            Telemetry::Relays(_) => "relays",
            Telemetry::Param(_) => "param",
            Telemetry::Pid(_) => "pid",
            Telemetry::Echo(_) => "echo",
            Telemetry::DeviceError(_) => "device_error",
            Telemetry::Other(_) => "other",
        }
    }

    /// Acknowledgement payload, if this record is one.
    pub fn as_ack(&self) -> Option<&Ack> {
        match self {
            Telemetry::Ack(ack) => Some(ack),
            _ => None,
        }
    }
}

impl TryFrom<Value> for Telemetry {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Telemetry::from_object(map)),
            other => Err(format!("expected JSON object, found {}", json_kind(&other))),
        }
    }
}

impl<'de> Deserialize<'de> for Telemetry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Telemetry::try_from(value).map_err(D::Error::custom)
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(value: Value) -> Telemetry {
        Telemetry::try_from(value).unwrap()
    }

    #[test]
    fn commands_serialise_with_single_key() {
        let cases = [
            (Command::forward(), json!({"dir": "f"})),
            (Command::speed(150), json!({"speed": 100})),
            (
                Command::Pid(PidParams::new(0.4, 1.45, 0.0, 80)),
                json!({"pid": {"kp": 0.4, "ki": 1.45, "kd": 0.0, "sample": 80}}),
            ),
            (Command::Get(DeviceQuery::Post), json!({"get": "post"})),
            (
                Command::Set(ParamSetting::Updt(250)),
                json!({"set": {"updt": 250}}),
            ),
            (
                Command::Acc(AccessoryCommand {
                    id: 3,
                    port: 1,
                    cmd: AccessoryOp::Pulse,
                }),
                json!({"acc": {"id": 3, "port": 1, "cmd": "p"}}),
            ),
            (
                Command::Rel(RelayCommand {
                    id: 2,
                    cmd: RelayOp::Off,
                }),
                json!({"rel": {"id": 2, "cmd": "off"}}),
            ),
        ];
        for (command, expected) in cases {
            assert_eq!(serde_json::to_value(&command).unwrap(), expected);
        }
    }

    #[test]
    fn classifies_records_by_key() {
        assert!(matches!(
            classify(json!({"bemf": 1, "target": 2, "rate": 400, "current": 30})),
            Telemetry::Sample(Sample { rate: 400, dir: None, .. })
        ));
        assert!(matches!(
            classify(json!({"freeram": 1600, "dir": "f"})),
            Telemetry::Heartbeat(Heartbeat { freeram: 1600, dir: Some(Direction::Forward) })
        ));
        assert_eq!(
            classify(json!({"ack": false, "cmd": "pid"})).as_ack(),
            Some(&Ack { ok: false, cmd: "pid".into() })
        );
        assert!(matches!(
            classify(json!({"dir": "s"})),
            Telemetry::Direction(DirectionReport { dir: Direction::Stop })
        ));
        assert!(matches!(classify(json!({"accp": 20})), Telemetry::Param(ParamSetting::Accp(20))));
        assert!(matches!(classify(json!({"turnouts": 16})), Telemetry::Turnouts(_)));
        assert!(matches!(
            classify(json!({"speed": 50})),
            Telemetry::Echo(Command::Speed(50))
        ));
        assert!(matches!(classify(json!({"error": "json"})), Telemetry::DeviceError(_)));
        match classify(json!({"post": "PASS"})) {
            Telemetry::SelfTest(report) => assert!(report.passed()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ports_accept_numbers_and_booleans() {
        match classify(json!({"ports": [1, 0, true]})) {
            Telemetry::Ports(report) => {
                let flags: Vec<bool> = report.ports.iter().map(PortFlag::is_set).collect();
                assert_eq!(flags, vec![true, false, true]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_or_extra_keys_fall_back_to_other() {
        let raw = json!({"bemf": 1, "target": 2, "rate": 3, "current": 4, "temp": 40});
        let record = classify(raw.clone());
        assert!(matches!(record, Telemetry::Other(_)));
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);

        let raw = json!({"dir": "x"});
        assert!(matches!(classify(raw), Telemetry::Other(_)));
    }

    #[test]
    fn typed_records_reserialise_verbatim() {
        let raws = [
            json!({"bemf": 1200, "target": 1100, "rate": 400, "current": 310, "dir": "f", "freeram": 1550}),
            json!({"bemf": 12.5, "target": 11.0, "rate": 400, "current": 0.31}),
            json!({"kp": 0.4, "ki": 1.45, "kd": 0.0, "sample": 80}),
            json!({"ack": true, "cmd": "set"}),
            json!({"set": {"accm": 1500}}),
        ];
        for raw in raws {
            let record = classify(raw.clone());
            assert!(!matches!(record, Telemetry::Other(_)), "{raw} fell through");
            assert_eq!(serde_json::to_value(&record).unwrap(), raw);
        }
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(Telemetry::try_from(json!([1, 2])).is_err());
        assert!(serde_json::from_str::<Telemetry>("42").is_err());
    }

    #[test]
    fn parses_operator_spellings() {
        assert_eq!("Forward".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!("updt".parse::<DeviceQuery>().unwrap(), DeviceQuery::Updt);
        assert_eq!("pulse".parse::<AccessoryOp>().unwrap(), AccessoryOp::Pulse);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(ParamSetting::from_name("accp", 5), Some(ParamSetting::Accp(5)));
    }
}
