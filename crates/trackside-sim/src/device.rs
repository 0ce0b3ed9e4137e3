//! ---
//! ts_section: "11-simulation-test-harness"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Protocol and physics core of the emulated motor controller."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use trackside_common::EmulatorConfig;
use trackside_proto::{
    sanitize, Ack, Command, DeviceFault, DeviceQuery, Direction, Heartbeat, ParamSetting,
    PidParams, PortFlag, PortsReport, RelayCount, RelayOp, Sample, SelfTest, Telemetry,
    TurnoutCount, MAX_SPEED,
};

use crate::filter::MovingAverage;
use crate::noise::NoiseGenerator;
use crate::physics::{
    current_to_milliamps, rpm_to_millivolts, Drive, MotorModel, MotorState, Reading,
};
use crate::EmulatorError;

const MIN_UPDATE_MS: u32 = 100;
const TURNOUT_PULSE_MS: std::ops::RangeInclusive<u32> = 5..=200;
const FREERAM_RANGE: (u32, u32) = (1500, 1700);

/// Everything a processed line asks of the runtime.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HandleOutcome {
    /// Records to write back, in order.
    pub replies: Vec<Telemetry>,
    /// New telemetry period after `set updt`.
    pub retick: Option<Duration>,
    /// A speed change happened; re-arm the settle timer.
    pub settle: bool,
}

/// Synchronous controller model. Timers live in [`crate::Emulator`].
#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatorConfig,
    model: MotorModel,
    noise: NoiseGenerator,
    motor: MotorState,
    measured: Reading,
    target_rpm: f64,
    pwm: u16,
    pwm_target: u16,
    direction: Direction,
    rpm_filter: MovingAverage,
    current_filter: MovingAverage,
    pid: PidParams,
    update_period: Duration,
    turnout_pulse_ms: u32,
    accessory_max_on_ms: u32,
    relays: Vec<bool>,
}

impl EmulatedDevice {
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        config
            .validate()
            .map_err(|err| EmulatorError::InvalidConfig(err.to_string()))?;
        let pid = PidParams::new(
            config.pid.kp,
            config.pid.ki,
            config.pid.kd,
            config.pid.sample_ms,
        );
        Ok(Self {
            model: MotorModel::new(config.physics),
            noise: NoiseGenerator::new(config.seed),
            motor: MotorState::default(),
            measured: Reading::default(),
            target_rpm: 0.0,
            pwm: 0,
            pwm_target: 0,
            direction: Direction::Stop,
            rpm_filter: MovingAverage::new(config.buffer_size),
            current_filter: MovingAverage::new(config.buffer_size),
            pid,
            update_period: config.tick_interval,
            turnout_pulse_ms: config.limits.turnout_pulse_ms,
            accessory_max_on_ms: config.limits.accessory_max_on_ms,
            relays: vec![false; usize::from(config.limits.relays)],
            config,
        })
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pwm(&self) -> u16 {
        self.pwm
    }

    pub fn pid(&self) -> PidParams {
        self.pid
    }

    pub fn update_period(&self) -> Duration {
        self.update_period
    }

    pub fn is_ramping(&self) -> bool {
        self.pwm != self.pwm_target
    }

    pub fn relay(&self, id: u16) -> Option<bool> {
        let index = usize::from(id).checked_sub(1)?;
        self.relays.get(index).copied()
    }

    /// Process one inbound line: echo it, apply it, acknowledge it.
    pub fn handle_line(&mut self, line: &[u8]) -> HandleOutcome {
        let mut outcome = HandleOutcome::default();
        let text = sanitize(line);
        let text = text.trim();
        if text.is_empty() {
            return outcome;
        }

        let map = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                debug!(line = text, "emulator rejected unparseable command");
                outcome.replies.push(Telemetry::DeviceError(DeviceFault {
                    error: String::from("json"),
                }));
                return outcome;
            }
        };

        outcome.replies.push(Telemetry::from_object(map.clone()));

        let Some(name) = map
            .keys()
            .find(|key| Command::NAMES.contains(&key.as_str()))
            .cloned()
        else {
            debug!(line = text, "emulator ignored object without command key");
            return outcome;
        };

        let ok = match serde_json::from_value::<Command>(Value::Object(map)) {
            Ok(command) => self.apply(command, &mut outcome),
            Err(err) => {
                debug!(cmd = %name, error = %err, "emulator rejected command payload");
                false
            }
        };
        outcome.replies.push(Telemetry::Ack(Ack { ok, cmd: name }));
        outcome
    }

    fn apply(&mut self, command: Command, outcome: &mut HandleOutcome) -> bool {
        match command {
            Command::Dir(direction) => {
                self.direction = direction;
                if direction == Direction::Stop {
                    self.pwm_target = 0;
                    self.clear_measurements();
                    outcome.settle = true;
                }
                true
            }
            Command::Speed(percent) => {
                let percent = percent.min(MAX_SPEED);
                let pwm = u32::from(percent) * u32::from(self.config.max_pwm) / u32::from(MAX_SPEED);
                self.pwm_target = u16::try_from(pwm).unwrap_or(self.config.max_pwm);
                outcome.settle = true;
                true
            }
            Command::Pid(params) => {
                let gains = [params.kp, params.ki, params.kd];
                if gains.iter().any(|gain| !gain.is_finite() || *gain < 0.0)
                    || params.sample_ms == 0
                {
                    return false;
                }
                self.pid = params;
                true
            }
            Command::Get(query) => {
                let reply = self.query(query);
                outcome.replies.push(reply);
                true
            }
            Command::Set(setting) => self.apply_setting(setting, outcome),
            Command::Acc(acc) => {
                (1..=self.config.limits.turnouts).contains(&acc.id) && acc.port <= 1
            }
            Command::Rel(rel) => match usize::from(rel.id).checked_sub(1) {
                Some(index) if index < self.relays.len() => {
                    self.relays[index] = rel.cmd == RelayOp::On;
                    true
                }
                _ => false,
            },
        }
    }

    fn apply_setting(&mut self, setting: ParamSetting, outcome: &mut HandleOutcome) -> bool {
        match setting {
            ParamSetting::Updt(ms) if ms >= MIN_UPDATE_MS => {
                self.update_period = Duration::from_millis(u64::from(ms));
                outcome.retick = Some(self.update_period);
                true
            }
            ParamSetting::Accp(ms) if TURNOUT_PULSE_MS.contains(&ms) => {
                self.turnout_pulse_ms = ms;
                true
            }
            ParamSetting::Accm(ms) if ms <= self.config.limits.accessory_max_on_ms => {
                self.accessory_max_on_ms = ms;
                true
            }
            _ => false,
        }
    }

    fn query(&self, query: DeviceQuery) -> Telemetry {
        let limits = &self.config.limits;
        match query {
            DeviceQuery::Pid => Telemetry::Pid(self.pid),
            DeviceQuery::Turnouts => Telemetry::Turnouts(TurnoutCount {
                turnouts: limits.turnouts,
            }),
            DeviceQuery::Relays => Telemetry::Relays(RelayCount {
                relays: limits.relays,
            }),
            DeviceQuery::Post => Telemetry::SelfTest(SelfTest {
                post: String::from("PASS"),
                err: None,
            }),
            DeviceQuery::Ports => Telemetry::Ports(PortsReport {
                ports: vec![PortFlag::Level(1); limits.accessory_ports],
            }),
            DeviceQuery::Accp => Telemetry::Param(ParamSetting::Accp(self.turnout_pulse_ms)),
            DeviceQuery::Accm => Telemetry::Param(ParamSetting::Accm(self.accessory_max_on_ms)),
            DeviceQuery::Updt => {
                let ms = u32::try_from(self.update_period.as_millis()).unwrap_or(u32::MAX);
                Telemetry::Param(ParamSetting::Updt(ms))
            }
        }
    }

    /// Advance the physics by `dt` and produce the periodic sample.
    pub fn tick(&mut self, dt: Duration) -> Telemetry {
        let drive = match self.direction {
            Direction::Stop => Drive::Stopped,
            Direction::Forward | Direction::Backward => Drive::Running {
                pwm: f64::from(self.pwm),
            },
        };
        let (motor, reading) = self
            .model
            .step(self.motor, drive, self.noise.disturbance(), dt);
        self.motor = motor;
        match reading {
            Some(reading) => {
                self.measured = Reading {
                    rpm: self.rpm_filter.push(reading.rpm),
                    current: self.current_filter.push(reading.current),
                };
                self.target_rpm = self.model.track_setpoint(
                    self.target_rpm,
                    self.measured.rpm,
                    f64::from(self.pwm),
                    dt,
                );
            }
            None => self.measured = self.model.coast(self.measured, dt),
        }

        Telemetry::Sample(Sample::new(
            rpm_to_millivolts(self.measured.rpm),
            rpm_to_millivolts(self.target_rpm),
            i64::from(self.pwm),
            current_to_milliamps(self.measured.current),
        ))
    }

    pub fn heartbeat(&mut self) -> Telemetry {
        Telemetry::Heartbeat(Heartbeat {
            freeram: self.noise.between(FREERAM_RANGE.0, FREERAM_RANGE.1),
            dir: Some(self.direction),
        })
    }

    /// One ramp increment toward the requested PWM.
    pub fn ramp_step(&mut self) {
        let step = self.config.ramp_step;
        self.pwm = if self.pwm < self.pwm_target {
            self.pwm.saturating_add(step).min(self.pwm_target)
        } else {
            self.pwm.saturating_sub(step).max(self.pwm_target)
        };
    }

    /// Zero the smoothing buffers and readings, as the firmware does on stop.
    fn clear_measurements(&mut self) {
        self.rpm_filter.reset();
        self.current_filter.reset();
        self.measured = Reading::default();
        self.target_rpm = 0.0;
    }

    /// Snap the PID setpoint to the measured speed once the train settled.
    pub fn settle(&mut self) {
        self.target_rpm = self.measured.rpm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::statistics::Statistics;

    fn device() -> EmulatedDevice {
        EmulatedDevice::new(EmulatorConfig {
            seed: 7,
            ..EmulatorConfig::default()
        })
        .unwrap()
    }

    fn last_ack(outcome: &HandleOutcome) -> &Ack {
        outcome
            .replies
            .last()
            .and_then(Telemetry::as_ack)
            .expect("ack reply")
    }

    #[test]
    fn echoes_then_acknowledges() {
        let mut device = device();
        let outcome = device.handle_line(b"{\"speed\":50}\n");
        assert_eq!(outcome.replies.len(), 2);
        assert_eq!(outcome.replies[0], Telemetry::Echo(Command::Speed(50)));
        assert_eq!(last_ack(&outcome), &Ack { ok: true, cmd: "speed".into() });
        assert!(outcome.settle);
        assert!(device.is_ramping());
    }

    #[test]
    fn unparseable_input_reports_json_error() {
        let mut device = device();
        let outcome = device.handle_line(b"{\"speed\":");
        assert_eq!(
            outcome.replies,
            vec![Telemetry::DeviceError(DeviceFault { error: "json".into() })]
        );
        assert!(device.handle_line(b"\r\n").replies.is_empty());
    }

    #[test]
    fn rejects_out_of_protocol_values() {
        let mut device = device();
        for (line, cmd) in [
            (r#"{"speed":300}"#, "speed"),
            (r#"{"get":"volume"}"#, "get"),
            (r#"{"set":{"updt":50}}"#, "set"),
            (r#"{"set":{"accp":250}}"#, "set"),
            (r#"{"set":{"accm":2500}}"#, "set"),
            (r#"{"acc":{"id":17,"port":0,"cmd":"p"}}"#, "acc"),
            (r#"{"acc":{"id":1,"port":2,"cmd":"p"}}"#, "acc"),
            (r#"{"rel":{"id":5,"cmd":"on"}}"#, "rel"),
            (r#"{"pid":{"kp":-1.0,"ki":0.0,"kd":0.0,"sample":80}}"#, "pid"),
        ] {
            let outcome = device.handle_line(line.as_bytes());
            assert_eq!(last_ack(&outcome), &Ack { ok: false, cmd: cmd.into() }, "{cmd}");
        }
    }

    #[test]
    fn speed_above_full_scale_is_clamped() {
        let mut device = device();
        let outcome = device.handle_line(br#"{"speed":150}"#);
        assert_eq!(last_ack(&outcome), &Ack { ok: true, cmd: "speed".into() });
        while device.is_ramping() {
            device.ramp_step();
        }
        assert_eq!(device.pwm(), 800);
    }

    #[test]
    fn answers_get_queries() {
        let mut device = device();
        let outcome = device.handle_line(b"{\"get\":\"pid\"}");
        assert_eq!(outcome.replies[1], Telemetry::Pid(PidParams::new(0.40, 1.45, 0.0, 80)));
        assert!(last_ack(&outcome).ok);

        let outcome = device.handle_line(b"{\"get\":\"ports\"}");
        match &outcome.replies[1] {
            Telemetry::Ports(report) => assert_eq!(report.ports.len(), 32),
            other => panic!("unexpected {other:?}"),
        }

        let outcome = device.handle_line(b"{\"get\":\"post\"}");
        assert!(matches!(&outcome.replies[1], Telemetry::SelfTest(t) if t.passed()));
    }

    #[test]
    fn set_updt_requests_retick() {
        let mut device = device();
        let outcome = device.handle_line(b"{\"set\":{\"updt\":250}}");
        assert_eq!(outcome.retick, Some(Duration::from_millis(250)));
        assert_eq!(device.update_period(), Duration::from_millis(250));
        let outcome = device.handle_line(b"{\"get\":\"updt\"}");
        assert_eq!(outcome.replies[1], Telemetry::Param(ParamSetting::Updt(250)));
    }

    #[test]
    fn pid_update_is_stored() {
        let mut device = device();
        let outcome =
            device.handle_line(b"{\"pid\":{\"kp\":1.5,\"ki\":0.5,\"kd\":0.1,\"sample\":100}}");
        assert!(last_ack(&outcome).ok);
        assert_eq!(device.pid(), PidParams::new(1.5, 0.5, 0.1, 100));
    }

    #[test]
    fn relays_track_state() {
        let mut device = device();
        assert!(last_ack(&device.handle_line(b"{\"rel\":{\"id\":2,\"cmd\":\"on\"}}")).ok);
        assert_eq!(device.relay(2), Some(true));
        assert_eq!(device.relay(0), None);
    }

    #[test]
    fn ramp_moves_in_bounded_steps() {
        let mut device = device();
        device.handle_line(b"{\"speed\":50}");
        let mut steps = 0;
        while device.is_ramping() {
            let before = device.pwm();
            device.ramp_step();
            assert!(device.pwm() - before <= 8);
            steps += 1;
        }
        assert_eq!(device.pwm(), 400);
        assert_eq!(steps, 50);

        device.handle_line(b"{\"dir\":\"s\"}");
        while device.is_ramping() {
            device.ramp_step();
        }
        assert_eq!(device.pwm(), 0);
        assert_eq!(device.direction(), Direction::Stop);
    }

    fn bemf(record: &Telemetry) -> f64 {
        match record {
            Telemetry::Sample(sample) => sample.bemf_mv(),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn drive_to_cruise(device: &mut EmulatedDevice, dt: Duration) -> f64 {
        device.handle_line(b"{\"dir\":\"f\"}");
        device.handle_line(b"{\"speed\":50}");
        while device.is_ramping() {
            device.ramp_step();
        }
        for _ in 0..150 {
            device.tick(dt);
        }
        let window: Vec<f64> = (0..100).map(|_| bemf(&device.tick(dt))).collect();
        window.iter().mean()
    }

    #[test]
    fn steady_drive_converges_and_zeroes_on_stop() {
        let mut device = device();
        let dt = device.update_period();
        let mean = drive_to_cruise(&mut device, dt);
        let expected = rpm_to_millivolts(400.0) as f64;
        assert!((mean - expected).abs() / expected < 0.05, "mean {mean}");

        device.handle_line(b"{\"dir\":\"s\"}");
        match device.tick(dt) {
            Telemetry::Sample(sample) => {
                assert_eq!(sample.bemf_mv(), 0.0);
                assert_eq!(sample.target_mv(), 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn restart_after_stop_does_not_replay_cruise_readings() {
        let mut device = device();
        let dt = device.update_period();
        let running = drive_to_cruise(&mut device, dt);

        device.handle_line(b"{\"dir\":\"s\"}");
        while device.is_ramping() {
            device.ramp_step();
        }
        for _ in 0..60 {
            device.tick(dt);
        }
        device.handle_line(b"{\"dir\":\"f\"}");
        let restarted = bemf(&device.tick(dt));
        assert_eq!(device.pwm(), 0);
        assert!(restarted < running * 0.1, "restarted {restarted} running {running}");
    }

    #[test]
    fn heartbeat_reports_direction() {
        let mut device = device();
        match device.heartbeat() {
            Telemetry::Heartbeat(Heartbeat { freeram, dir }) => {
                assert!((1500..1700).contains(&freeram));
                assert_eq!(dir, Some(Direction::Stop));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
