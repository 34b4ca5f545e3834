use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{Result, eyre::Context};

use crate::{
    cli::{Cli, Commands},
    config::Options,
    system::System,
};

mod cli;
mod config;
mod controller;
mod conversion;
mod decoder;
mod error;
mod eqset;
mod events;
mod io_stream;
mod output;
mod output_buffer;
mod player;
mod playlist;
mod precache;
mod protocol;
mod scan;
mod server;
mod system;
mod tags_cache;

/// pub so doctests work
pub mod util;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install().unwrap();
    setup_tracing();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from("config.toml"));
    let mut options = Options::load(&config_path).wrap_err("Could not load config")?;
    if let Some(socket) = &cli.socket {
        options.moc_dir = socket.parent().map(|p| p.to_owned());
    }

    match cli.command {
        Commands::Run(args) => {
            options.music_dir = Some(args.music_dir);
            let system = System::new(options).wrap_err("Could not start system")?;
            let socket_path = system.options.moc_dir()?.join("socket");
            system.run(&socket_path).await?;
        }
        Commands::Scan(args) => {
            options.music_dir = Some(args.music_dir.clone());
            let system = System::new(options).wrap_err("Could not start system")?;
            let count = scan::scan_dir(&args.music_dir, &system.tags_cache)
                .wrap_err("Could not scan music directory")?;
            tracing::info!(count, "scan complete");
        }
        Commands::Eq => {
            let options = Options::load(&config_path).wrap_err("Could not load config")?;
            let eqsets_dir = options.eqsets_dir()?;
            for name in eqset::list_presets(&eqsets_dir)? {
                println!("{name}");
            }
        }
    }

    Ok(())
}

pub fn setup_tracing() {
    use tracing_subscriber::filter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = filter::EnvFilter::builder().from_env().unwrap();
    let fmt = fmt::layer().pretty().with_line_number(true);

    let _ignore_err = tracing_subscriber::registry()
        .with(fmt)
        .with(filter)
        .try_init();
}
