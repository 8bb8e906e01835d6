//! Clap CLI definitions for iopmesh.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  iopmesh run --name Sensor --definition sensor.json
  iopmesh run --name Display --definition display.json --mapping map.json --connect 127.0.0.1:5670
  iopmesh definition show sensor.json
  iopmesh definition variants a.json b.json
  iopmesh mapping show map.json --definition display.json
  iopmesh config show";

/// iopmesh: peer-to-peer agent IOP substrate.
#[derive(Parser)]
#[command(
    name = "iopmesh",
    version,
    about = "iopmesh \u{2014} peer-to-peer agent IOP substrate",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file (default: ./iopmesh.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an agent and print its events until Ctrl+C.
    Run(RunArgs),
    /// Inspect definition files [*].
    #[command(subcommand)]
    Definition(DefinitionCommands),
    /// Inspect mapping files [*].
    #[command(subcommand)]
    Mapping(MappingCommands),
    /// Show the effective configuration [*].
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Agent name announced to peers.
    #[arg(long)]
    pub name: Option<String>,
    /// Address to listen on, e.g. 0.0.0.0:5670.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Definition JSON to activate at start.
    #[arg(long)]
    pub definition: Option<PathBuf>,
    /// Mapping JSON to load at start.
    #[arg(long)]
    pub mapping: Option<PathBuf>,
    /// Peer to keep a connection to (repeatable).
    #[arg(long = "connect", value_name = "ADDR")]
    pub connect: Vec<SocketAddr>,
    /// Shared secret for handshake authentication.
    #[arg(long)]
    pub secret: Option<String>,
    /// Print events as JSON lines.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum DefinitionCommands {
    /// Validate a definition and print its IOPs and fingerprint.
    Show {
        file: PathBuf,
        /// Print the normalized definition as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Report agents sharing a name and version but differing in structure.
    Variants {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum MappingCommands {
    /// Validate a mapping and list its elements.
    Show {
        file: PathBuf,
        /// Check inputs against this definition.
        #[arg(long)]
        definition: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration after defaults and environment overrides.
    Show,
}
