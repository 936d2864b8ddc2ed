//! # CLI Interface
//!
//! Defines the command-line argument structure for `verid-node` using
//! `clap` derive. Supports two subcommands: `run` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// VERID network node.
///
/// A message-queue node for the VERID identity-verification network.
/// Delivers application messages reliably between member nodes and gates
/// their processing on confirmed chain heights from the local chain feed.
#[derive(Parser, Debug)]
#[command(
    name = "verid-node",
    about = "VERID network node",
    version,
    propagate_version = true
)]
pub struct VeridNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the VERID node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node data directory where the database is stored.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "VERID_DATA_DIR", default_value = "~/.verid")]
    pub data_dir: PathBuf,

    /// Node identity written into outbound message envelopes.
    #[arg(long, env = "VERID_NODE_ID")]
    pub node_id: String,

    /// UDP address the message queue binds to.
    #[arg(long, env = "VERID_MQ_LISTEN", default_value = "0.0.0.0:5555")]
    pub mq_listen: String,

    /// TCP address the chain feed listener binds to.
    ///
    /// The local chain daemon connects here and streams newline-delimited
    /// JSON status and block events.
    #[arg(long, env = "VERID_CHAIN_FEED_LISTEN", default_value = "0.0.0.0:5556")]
    pub chain_feed_listen: String,

    /// Milliseconds between retransmissions of an unacknowledged message.
    #[arg(long, env = "VERID_RETRY_INTERVAL_MS", default_value_t = 5_000)]
    pub retry_interval_ms: u64,

    /// Milliseconds after which delivery of a message is abandoned.
    #[arg(long, env = "VERID_TOTAL_TIMEOUT_MS", default_value_t = 120_000)]
    pub total_timeout_ms: u64,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "VERID_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}
