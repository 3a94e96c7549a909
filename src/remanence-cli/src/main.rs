mod cli;
mod commands;
mod snapshot;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Log to stderr so `cat` can stream entry content on stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remanence=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(image) = cli.image.as_deref() else {
        bail!("--image is required");
    };
    let (map, meta) = commands::open_map(image, cli.meta.as_deref())?;

    match cli.command {
        Commands::Info => {
            commands::info(&map, &meta)?;
        }

        Commands::Scan {
            pid,
            via,
            limit,
            json,
        } => {
            commands::scan(&map, pid, via, limit, json)?;
        }

        Commands::Lookup { address } => {
            commands::lookup(&map, &address)?;
        }

        Commands::Ls { address } => {
            commands::ls(&map, &address)?;
        }

        Commands::Cat {
            address,
            entry,
            offset,
            length,
            out,
        } => {
            commands::cat(&map, &address, &entry, offset, length, out.as_deref())?;
        }

        Commands::Read {
            address,
            offset,
            length,
        } => {
            commands::read(&map, &address, offset, length)?;
        }
    }

    Ok(())
}
