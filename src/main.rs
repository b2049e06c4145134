//! tbbingest: TBB transient frame ingestion.
//!
//! Validates, time-corrects and stores raw TBB frames from dump files or a
//! live UDP stream. Run `tbbingest --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod color;
mod config;
mod ingest;
mod inspect;
mod listen;
mod report;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => None,
        _ => {
            if !cli.config.exists() {
                std::fs::write(&cli.config, b"")?;
                eprintln!(
                    "Created '{}'; run `tbbingest init` for a full example.",
                    cli.config.display()
                );
            }
            let mut cfg = config::IngestConfig::load(&cli.config)?;
            cli.session.apply(&mut cfg.session);
            Some(cfg)
        }
    };

    match (cli.command, config) {
        (Commands::Init, _) => {
            let example = config::IngestConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        (Commands::File { inputs, output, frame_size, report }, Some(cfg)) => {
            ingest::run(&cfg, &inputs, &output, frame_size, report.as_deref())?;
        }
        (Commands::Listen { output, listen: overrides, report }, Some(mut cfg)) => {
            overrides.apply(&mut cfg.listen);
            listen::run(&cfg, &output, report.as_deref())?;
        }
        (Commands::Inspect { input, frame_size, count }, Some(cfg)) => {
            inspect::run(&cfg.session, &input, frame_size, count)?;
        }
        (_, None) => anyhow::bail!("no configuration loaded"),
    }

    Ok(())
}
