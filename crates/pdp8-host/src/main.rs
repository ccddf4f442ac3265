mod bridge;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use pdp8_core::hardware::{MapError, SharedHardwareMap};
use pdp8_relay::{RelayError, spawn_relay};
use thiserror::Error;

use crate::bridge::Bridge;
use crate::config::ConfigError;

#[derive(Parser)]
struct Args {
    /// Host configuration file (TOML). Defaults to the XDG config location.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the relay listens on
    #[arg(long)]
    relay: Option<SocketAddr>,

    /// Boot loader to deposit before the loop starts
    #[arg(long)]
    boot: Option<String>,

    /// Stop after this many ticks instead of running until killed
    #[arg(long)]
    ticks: Option<u64>,
}

#[derive(Error, Debug)]
enum HostError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

fn run(args: Args) -> Result<(), HostError> {
    let path = args.config.unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_from_file(&path);
    if let Some(addr) = args.relay {
        cfg.relay.bind = addr;
    }
    if args.boot.is_some() {
        cfg.boot = args.boot;
    }

    let map = SharedHardwareMap::open(&cfg.hardware)?;
    let mut bridge = Bridge::new(&map, &cfg)?;
    let relay = spawn_relay(&cfg.relay)?;
    info!("Host: relay listening on {}", relay.local_addr());
    for event in bridge.snapshot() {
        relay.publish(event);
    }

    while args.ticks.is_none_or(|limit| bridge.bus().ticks() < limit) {
        while let Some(command) = relay.try_recv_command() {
            if let Some(reply) = bridge.apply(command) {
                relay.publish(reply);
            }
        }
        for event in bridge.step() {
            relay.publish(event);
        }
    }

    info!(
        "Host: stopped after {} ticks ({} missed deadlines)",
        bridge.bus().ticks(),
        bridge.governor().slips()
    );
    relay.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
