// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # VERID Network Node
//!
//! Entry point for the `verid-node` binary. Parses CLI arguments,
//! initializes logging, and runs the node: reliable message delivery over
//! UDP, height-gated request dispatch, and the chain feed listener.
//!
//! The binary supports two subcommands:
//!
//! - `run`     — start the node
//! - `version` — print build version information

mod cli;
mod feed;
mod logging;
mod runtime;

use anyhow::Result;
use clap::Parser;

use cli::{Commands, VeridNodeCli};
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = VeridNodeCli::parse();

    match cli.command {
        Commands::Run(args) => {
            logging::init_logging(
                "verid_node=info,verid_protocol=info",
                LogFormat::from_str_lossy(&args.log_format),
            );
            runtime::run(args).await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Prints build version information.
fn print_version() {
    println!(
        "verid-node {} (wire version {})",
        env!("CARGO_PKG_VERSION"),
        verid_protocol::config::WIRE_VERSION,
    );
}
