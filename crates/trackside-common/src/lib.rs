//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Shared primitives and utilities for the core runtime."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
//! Shared primitives for the Trackside workspace: configuration loading and
//! tracing initialisation consumed by the daemon, the CLI and the link crates.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, DeviceLimits, EmulatorConfig, LinkConfig, LoadedAppConfig, LoggingConfig,
    MetricsConfig, PhysicsConfig, PidDefaults, ServerConfig, ThrottleConfig, WatchdogConfig,
};
pub use logging::{init_cli, init_tracing, LogFormat};
