//! iopmesh CLI — run agents and inspect definition and mapping files.

mod cli;
mod cmd;
pub mod table;
mod ui;

use crate::cli::*;
use clap::Parser;

/// Trace to stderr; stdout carries command output.
fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Run(args) => cmd::run::cmd_run(cli.config, args),
        Commands::Definition(sub) => match sub {
            DefinitionCommands::Show { file, json } => {
                cmd::definition::cmd_definition_show(&file, json)
            }
            DefinitionCommands::Variants { files } => {
                cmd::definition::cmd_definition_variants(&files)
            }
        },
        Commands::Mapping(MappingCommands::Show { file, definition }) => {
            cmd::mapping::cmd_mapping_show(&file, definition.as_deref())
        }
        Commands::Config(ConfigCommands::Show) => cmd::config::cmd_config_show(cli.config),
    }
}
