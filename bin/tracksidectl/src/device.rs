//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "binary"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Parameter, accessory and diagnostic subcommands."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use trackside_client::LinkManager;
use trackside_proto::{AccessoryOp, RelayOp, Telemetry};

use crate::{await_ack, await_reply, require_open};

#[derive(Debug, Args)]
pub struct AccessoryArgs {
    /// Turnout decoder address.
    pub id: u16,
    /// Output port, 0 or 1.
    pub port: u8,
    /// p (pulse), on or off.
    pub op: AccessoryOp,
}

#[derive(Debug, Args)]
pub struct RelayArgs {
    /// Relay address.
    pub id: u16,
    /// on or off.
    pub op: RelayOp,
}

pub async fn get(manager: &LinkManager, name: &str, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;
    let mut events = manager.subscribe();
    manager.command().get_prop(name).await?;
    let reply = await_reply(&mut events, "get", wait).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

pub async fn set(manager: &LinkManager, name: &str, value: u32, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;
    let mut events = manager.subscribe();
    manager.command().set_prop(name, value).await?;
    await_ack(&mut events, "set", wait).await?;
    println!("{name} = {value}");
    Ok(())
}

pub async fn accessory(manager: &LinkManager, args: AccessoryArgs, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;
    let mut events = manager.subscribe();
    manager
        .command()
        .accessory(args.id, args.port, args.op)
        .await?;
    await_ack(&mut events, "acc", wait).await?;
    println!("ok");
    Ok(())
}

pub async fn relay(manager: &LinkManager, args: RelayArgs, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;
    let mut events = manager.subscribe();
    manager.command().relay(args.id, args.op).await?;
    await_ack(&mut events, "rel", wait).await?;
    println!("ok");
    Ok(())
}

pub async fn diag(manager: &LinkManager, wait: Duration) -> Result<()> {
    require_open(manager, wait).await?;

    let mut events = manager.subscribe();
    manager.command().self_test().await?;
    match await_reply(&mut events, "get", wait).await? {
        Telemetry::SelfTest(report) if report.passed() => println!("self test: PASS"),
        Telemetry::SelfTest(report) => println!("self test: {} {:?}", report.post, report.err),
        other => println!("self test: unexpected {}", other.kind()),
    }

    let mut events = manager.subscribe();
    manager.command().ports().await?;
    if let Telemetry::Ports(report) = await_reply(&mut events, "get", wait).await? {
        let map: String = report
            .ports
            .iter()
            .map(|flag| if flag.is_set() { '1' } else { '0' })
            .collect();
        println!("ports: {map}");
    }

    println!("turnouts: {}", manager.turnout_count().await?);
    println!("relays: {}", manager.relay_count().await?);
    Ok(())
}
