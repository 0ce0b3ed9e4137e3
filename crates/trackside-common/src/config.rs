//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "TOML configuration model for the link, throttle, emulator and listeners, with validation."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_server_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9898))
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_confirm_frames() -> u32 {
    5
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_write_queue() -> usize {
    64
}

fn default_max_line_length() -> usize {
    1024
}

fn default_min_interval() -> Duration {
    Duration::from_millis(400)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_attempts() -> u8 {
    3
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(300)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_buffer_size() -> usize {
    48
}

fn default_ramp_step() -> u16 {
    8
}

fn default_ramp_interval() -> Duration {
    Duration::from_millis(15)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_pwm() -> u16 {
    800
}

/// Primary configuration object for the Trackside runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "TRACKSIDE_CONFIG";

    /// Load configuration from disk, respecting the `TRACKSIDE_CONFIG` override.
    ///
    /// Unlike an explicit env override, missing candidates are not an error: the
    /// daemon falls back to defaults so a bare `tracksided` works out of the box.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        let config = AppConfig::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.throttle.validate()?;
        if self.watchdog.interval.is_zero() {
            return Err(anyhow!("watchdog.interval must be greater than zero"));
        }
        self.emulator.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_server_listen(),
        }
    }
}

/// Settings for the server-side device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Consecutive valid frames required before a fresh connection counts as open.
    #[serde(default = "default_confirm_frames")]
    pub confirm_frames: u32,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Endpoint opened when the daemon starts, e.g. `/dev/ttyUSB0` or `TEST`.
    #[serde(default)]
    pub auto_open: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            confirm_frames: default_confirm_frames(),
            broadcast_capacity: default_broadcast_capacity(),
            write_queue: default_write_queue(),
            max_line_length: default_max_line_length(),
            auto_open: None,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.confirm_frames == 0 {
            return Err(anyhow!("link.confirm_frames must be at least 1"));
        }
        if self.broadcast_capacity == 0 || self.write_queue == 0 {
            return Err(anyhow!("link queue capacities must be greater than zero"));
        }
        if self.max_line_length < 16 {
            return Err(anyhow!("link.max_line_length must be at least 16 bytes"));
        }
        Ok(())
    }
}

/// Coalescing and retry policy applied to continuous edits (speed, PID).
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_min_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_interval: Duration,
    #[serde(default = "default_ack_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ack_timeout: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            ack_timeout: default_ack_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_interval.is_zero() || self.ack_timeout.is_zero() {
            return Err(anyhow!("throttle intervals must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("throttle.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: default_watchdog_interval(),
        }
    }
}

/// Power-on PID tuning of the emulated controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidDefaults {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub sample_ms: u32,
}

impl Default for PidDefaults {
    fn default() -> Self {
        Self {
            kp: 0.40,
            ki: 1.45,
            kd: 0.0,
            sample_ms: 80,
        }
    }
}

/// Timing, physics and device limits of the emulated controller.
///
/// The tick interval and filter size together set the time constant of the
/// reported telemetry, so they are configuration rather than literals.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_ramp_step")]
    pub ramp_step: u16,
    #[serde(default = "default_ramp_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ramp_interval: Duration,
    #[serde(default = "default_settle_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
    #[serde(default = "default_max_pwm")]
    pub max_pwm: u16,
    #[serde(default)]
    pub physics: PhysicsConfig,
    /// Seed for the noise source; `0` draws from OS entropy.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub limits: DeviceLimits,
    #[serde(default)]
    pub pid: PidDefaults,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            buffer_size: default_buffer_size(),
            ramp_step: default_ramp_step(),
            ramp_interval: default_ramp_interval(),
            settle_delay: default_settle_delay(),
            max_pwm: default_max_pwm(),
            physics: PhysicsConfig::default(),
            seed: 0,
            limits: DeviceLimits::default(),
            pid: PidDefaults::default(),
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.ramp_interval.is_zero()
        {
            return Err(anyhow!("emulator intervals must be greater than zero"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("emulator.buffer_size must be at least 1"));
        }
        if self.ramp_step == 0 || self.max_pwm == 0 {
            return Err(anyhow!("emulator ramp_step and max_pwm must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.physics.inertia) {
            return Err(anyhow!("emulator.physics.inertia must lie within 0..=1"));
        }
        Ok(())
    }
}

/// Coefficients of the motor model, expressed per nominal tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub inertia: f64,
    pub noise_level: f64,
    pub current_noise: f64,
    pub current_gain: f64,
    pub load_step: f64,
    pub load_decay: f64,
    pub setpoint_tracking: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            inertia: 0.1,
            noise_level: 0.05,
            current_noise: 0.1,
            current_gain: 0.8,
            load_step: 0.02,
            load_decay: 0.98,
            setpoint_tracking: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    pub turnouts: u16,
    pub relays: u16,
    pub accessory_ports: usize,
    pub turnout_pulse_ms: u32,
    pub accessory_max_on_ms: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            turnouts: 16,
            relays: 4,
            accessory_ports: 32,
            turnout_pulse_ms: 20,
            accessory_max_on_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.throttle.min_interval, Duration::from_millis(400));
        assert_eq!(config.link.confirm_frames, 5);
        assert_eq!(config.emulator.buffer_size, 48);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: AppConfig = r#"
            [throttle]
            min_interval = 350

            [emulator]
            tick_interval = 100
            seed = 7
        "#
        .parse()
        .unwrap();
        assert_eq!(config.throttle.min_interval, Duration::from_millis(350));
        assert_eq!(config.throttle.max_attempts, 3);
        assert_eq!(config.emulator.tick_interval, Duration::from_millis(100));
        assert_eq!(config.emulator.seed, 7);
        assert_eq!(config.emulator.limits.turnouts, 16);
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = "[throttle]\nmax_attempts = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn loads_from_candidate_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[link]\nauto_open = \"TEST\"\nconfirm_frames = 3")?;
        file.flush()?;
        let config = AppConfig::from_path(file.path())?;
        assert_eq!(config.link.auto_open.as_deref(), Some("TEST"));
        assert_eq!(config.link.confirm_frames, 3);
        Ok(())
    }
}
