use camino::Utf8PathBuf;

#[derive(clap::Parser)]
pub struct Cli {
    /// Path to the control socket. Defaults to `<moc_dir>/socket2`.
    #[clap(long)]
    pub socket: Option<Utf8PathBuf>,
    /// Path to the config file. Defaults to `<moc_dir>/config.toml`.
    #[clap(long)]
    pub config: Option<Utf8PathBuf>,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the server: scans the music directory, opens the output
    /// driver, and listens on the control socket for clients.
    Run(RunArgs),
    /// Scan the music directory and refresh the tags cache, then exit.
    Scan(RunArgs),
    /// List or describe the saved equalizer presets in `eqsets/`.
    Eq,
}

#[derive(clap::Args)]
pub struct RunArgs {
    pub music_dir: Utf8PathBuf,
}
