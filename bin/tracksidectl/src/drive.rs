//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "binary"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Motion and PID subcommands."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Subcommand;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout_at, Instant};
use trackside_client::LinkManager;
use trackside_control::Outcome;
use trackside_proto::Telemetry;

use crate::{await_ack, await_reply, require_open};

#[derive(Debug, Subcommand)]
pub enum DriveCommand {
    /// Run forward.
    Forward,
    /// Run backward.
    Backward,
    /// Stop, ramping the motor down.
    Stop,
    /// Set the speed in percent (0-100).
    Speed {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },
}

#[derive(Debug, Subcommand)]
pub enum PidCommand {
    /// Read the PID parameters back from the device.
    Get,
    /// Replace the PID parameters.
    Set {
        kp: f64,
        ki: f64,
        kd: f64,
        /// Sample period in milliseconds.
        #[arg(default_value_t = 100)]
        sample: u32,
    },
}

pub async fn run_drive(manager: &LinkManager, command: DriveCommand, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;
    let mut events = manager.subscribe();
    let commands = manager.command();
    let name = match command {
        DriveCommand::Forward => {
            commands.forward().await?;
            "dir"
        }
        DriveCommand::Backward => {
            commands.backward().await?;
            "dir"
        }
        DriveCommand::Stop => {
            commands.stop().await?;
            "dir"
        }
        DriveCommand::Speed { percent } => {
            commands.speed(percent)?;
            "speed"
        }
    };
    await_ack(&mut events, name, wait).await?;
    println!("ok");
    Ok(())
}

pub async fn run_pid(manager: &LinkManager, command: PidCommand, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;
    match command {
        PidCommand::Get => {
            let mut events = manager.subscribe();
            manager.command().get_pid().await?;
            match await_reply(&mut events, "get", wait).await? {
                Telemetry::Pid(params) => {
                    println!("{}", serde_json::to_string_pretty(&params)?);
                    Ok(())
                }
                other => bail!("unexpected reply: {}", other.kind()),
            }
        }
        PidCommand::Set {
            kp,
            ki,
            kd,
            sample,
        } => {
            let mut outcomes = manager.pid_outcomes();
            manager.command().set_pid(kp, ki, kd, sample)?;
            // The retry budget spans several ack timeouts.
            let deadline = Instant::now() + wait * 4;
            loop {
                match timeout_at(deadline, outcomes.recv()).await {
                    Err(_) => bail!("timed out waiting for the pid acknowledgement"),
                    Ok(Err(RecvError::Lagged(_))) => continue,
                    Ok(Err(RecvError::Closed)) => bail!("pid governor stopped"),
                    Ok(Ok(Outcome::Acknowledged { .. })) => {
                        println!("pid updated");
                        return Ok(());
                    }
                    Ok(Ok(outcome)) => {
                        if let Some(err) = outcome.as_error() {
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }
}
