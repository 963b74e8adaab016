//! # reach
//!
//! Fleet management for agents behind NAT: agents dial out over SSH, punch a
//! reverse tunnel back to themselves, and serve operator requests inbound
//! over that tunnel.

mod agent;
mod cli;
mod config;
mod events;
mod health;
mod history;
mod policy;
mod pool;
mod protocol;
mod registry;
mod ssh;
mod web;

use cata::execute;
use clap::Parser;
use eyre::Result;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::config::HookBuilder::default()
        .display_location_section(false)
        .display_env_section(false)
        .install()?;

    let mut term = signal(SignalKind::terminate())?;
    let invocation = cli::Root::parse();

    // Both subcommands run until killed; SIGTERM is the orderly way out.
    tokio::select! {
        result = execute(&invocation) => result,
        _ = term.recv() => {
            tracing::info!("SIGTERM received, shutting down");
            Ok(())
        }
    }
}
