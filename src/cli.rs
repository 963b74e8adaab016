mod agent;
mod serve;

use std::sync::Mutex;

use cata::{Command, Container};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::Verbosity;
use clio::Output;
use eyre::Result;
use tracing_error::ErrorLayer;
use tracing_log::AsTrace;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[derive(Parser, Container)]
#[command(about = "Fleet management over reverse SSH tunnels")]
pub struct Root {
    #[command(subcommand)]
    command: RootCmd,

    /// Verbosity, stacking -v flags; RUST_LOG overrides
    #[command(flatten)]
    verbosity: Verbosity,

    /// Where logs go; "--" means stderr
    #[arg(long, default_value = "--", value_parser = parse_log_target)]
    log_file: Output,
}

#[derive(Subcommand, Container)]
enum RootCmd {
    Serve(serve::Serve),
    Agent(agent::Agent),
}

impl Command for Root {
    fn pre_run(&self) -> Result<()> {
        // -v flags set the floor; RUST_LOG directives take precedence when
        // present.
        let floor = self.verbosity.log_level_filter().as_trace();

        tracing_subscriber::registry()
            .with(ErrorLayer::default())
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(Mutex::new(self.log_file.clone()))
                    .with_filter(
                        EnvFilter::builder()
                            .with_default_directive(floor.into())
                            .from_env_lossy(),
                    ),
            )
            .init();

        Ok(())
    }
}

fn parse_log_target(raw: &str) -> Result<Output, clio::Error> {
    match raw {
        "--" => Ok(Output::std_err()),
        path => Output::new(path),
    }
}
