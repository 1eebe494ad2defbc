#![allow(dead_code)]

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

mod config;
mod configurator;
mod error;
mod middleware;
mod model;
mod mux;
mod observability;
mod predicate;
mod secret;
mod stats;
#[cfg(test)]
mod testutils;

use config::Config;
use configurator::Configurator;
use mux::location::EngineDefaults;
use mux::{MuxOptions, MuxServer};
use secret::SealKey;

#[derive(Parser, Debug)]
#[command(name = "muxd")]
#[command(about = "Programmable HTTP(S) reverse proxy")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    observability::init(&config.logging)?;

    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    info!("starting muxd");

    // Fail fast on an unusable seal key; the store client needs it to open
    // persisted TLS material.
    let _seal_key = if config.seal_key.is_empty() {
        None
    } else {
        Some(SealKey::from_base64(&config.seal_key).context("unreadable seal key")?)
    };

    let options = MuxOptions {
        default_listener: config
            .server
            .default_listener
            .as_ref()
            .map(|l| l.to_listener()),
        engine: EngineDefaults {
            dial_timeout: config.endpoint_dial_timeout(),
            read_timeout: config.endpoint_read_timeout(),
            max_mem_body_bytes: config.engine.max_mem_body_bytes,
        },
        drain_timeout: config.drain_timeout(),
    };
    let mux = MuxServer::new(options);

    // The configuration-store client feeds this channel; it lives outside
    // the core and owns the etcd session configured in `config.etcd`.
    let (events_tx, events_rx) = mpsc::channel(1024);
    let conf = Configurator::new(mux.clone());
    let configurator_task = tokio::spawn(async move { conf.run(events_rx).await });

    mux.start()
        .map_err(|e| anyhow::anyhow!("fatal bootstrap error: {e}"))?;
    info!("muxd started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = configurator_task => {
            error!("configurator exited unexpectedly");
        }
    }

    drop(events_tx);
    mux.stop(true).await;
    info!("muxd shutdown complete");
    Ok(())
}
