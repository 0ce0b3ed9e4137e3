//! ---
//! ts_section: "11-simulation-test-harness"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Pure motor model: inertia, load variation, BEMF and current."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::time::Duration;

use trackside_common::PhysicsConfig;

/// Tick length the per-tick coefficients are expressed in.
pub const NOMINAL_TICK: Duration = Duration::from_millis(300);

const COAST_INERTIA: f64 = 0.9;
const COAST_RPM: f64 = 0.95;
const COAST_CURRENT: f64 = 0.9;

/// Slow-moving mechanical state of the locomotive.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorState {
    /// Effective speed after inertia, in PWM units.
    pub inertia: f64,
    /// Relative load variation (hills, curves).
    pub load: f64,
}

/// Instantaneous measurement before smoothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub rpm: f64,
    pub current: f64,
}

/// Random inputs for one step, each uniform in `[-0.5, 0.5)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Disturbance {
    pub load: f64,
    pub bemf: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Drive {
    Running { pwm: f64 },
    Stopped,
}

/// Motor model with explicit coefficients. Every method is a pure function of
/// its arguments.
#[derive(Debug, Clone, Copy)]
pub struct MotorModel {
    params: PhysicsConfig,
}

impl MotorModel {
    pub fn new(params: PhysicsConfig) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PhysicsConfig {
        &self.params
    }

    /// Advance the model by `dt`. A stopped motor yields no reading; callers
    /// decay their last measurement with [`MotorModel::coast`] instead.
    pub fn step(
        &self,
        state: MotorState,
        drive: Drive,
        noise: Disturbance,
        dt: Duration,
    ) -> (MotorState, Option<Reading>) {
        let ticks = tick_ratio(dt);
        let pwm = match drive {
            Drive::Stopped => {
                let next = MotorState {
                    inertia: state.inertia * COAST_INERTIA.powf(ticks),
                    load: state.load,
                };
                return (next, None);
            }
            Drive::Running { pwm } => pwm,
        };

        let p = &self.params;
        let approach = 1.0 - (1.0 - p.inertia).powf(ticks);
        let inertia = state.inertia + (pwm - state.inertia) * approach;
        let load = (state.load + noise.load * p.load_step) * p.load_decay.powf(ticks);

        let base_rpm = inertia * (1.0 + load);
        let rpm = (base_rpm + noise.bemf * p.noise_level * base_rpm).max(0.0);
        let current =
            (inertia.max(0.0).sqrt() * p.current_gain + noise.current * p.current_noise).max(0.0);

        (MotorState { inertia, load }, Some(Reading { rpm, current }))
    }

    /// Decay a smoothed measurement while the motor is stopped.
    pub fn coast(&self, measured: Reading, dt: Duration) -> Reading {
        let ticks = tick_ratio(dt);
        Reading {
            rpm: measured.rpm * COAST_RPM.powf(ticks),
            current: measured.current * COAST_CURRENT.powf(ticks),
        }
    }

    /// Move the PID setpoint toward the measured speed while the drive is
    /// away from it.
    pub fn track_setpoint(&self, target: f64, measured_rpm: f64, pwm: f64, dt: Duration) -> f64 {
        if (pwm - target).abs() <= 0.1 {
            return target;
        }
        let gain = 1.0 - (1.0 - self.params.setpoint_tracking).powf(tick_ratio(dt));
        target + (measured_rpm - target) * gain
    }
}

fn tick_ratio(dt: Duration) -> f64 {
    dt.as_secs_f64() / NOMINAL_TICK.as_secs_f64()
}

/// Back-EMF in millivolts as reported by the firmware ADC scaling.
pub fn rpm_to_millivolts(rpm: f64) -> i64 {
    (rpm * 3.3 * 3.0 / 1024.0 * 1000.0).round() as i64
}

/// Motor current in milliamperes.
pub fn current_to_milliamps(current: f64) -> i64 {
    (current * 1000.0 / 1024.0).round() as i64
}
