use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cairn",
    about = "cairn: a content-addressed storage node",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Node configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository root, overriding the configuration file
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a repository, or open an existing one
    Init(InitArgs),
    /// Store a file
    Put(PutArgs),
    /// Show the stored metadata for a hash
    Info(InfoArgs),
    /// Delete stored content
    Delete(DeleteArgs),
    /// Show repository status
    Status(StatusArgs),
}

#[derive(Args)]
pub struct InitArgs {}

#[derive(Args)]
pub struct PutArgs {
    pub path: PathBuf,
    /// Name recorded in the metadata; defaults to the file name
    #[arg(long)]
    pub name: Option<String>,
    /// Keep the completed marker until the content is acknowledged
    #[arg(long)]
    pub no_ack: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    /// Content hash (hex)
    pub hash: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Content hash (hex)
    pub hash: String,
}

#[derive(Args)]
pub struct StatusArgs {}
