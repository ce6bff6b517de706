use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "repodb",
    about = "repodb -- JSON collections stored in a GitHub repository",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file. GITHUB_* variables override its values.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

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
    /// List collections and their record counts
    Collections,
    /// Print one record
    Get(RecordArgs),
    /// Write one record and wait until it is committed
    Set(SetArgs),
    /// Soft-delete one record
    Delete(RecordArgs),
    /// Print every record of a collection as one JSON object
    Dump(CollectionArgs),
    /// Show (or rebuild) a collection's index
    Index(IndexArgs),
    /// Write the database metadata file and print it
    Metadata,
    /// Move records from the flat legacy layout into collection directories
    Migrate(MigrateArgs),
}

#[derive(Args)]
pub struct RecordArgs {
    pub collection: String,
    pub key: String,
}

#[derive(Args)]
pub struct SetArgs {
    pub collection: String,
    pub key: String,
    /// Record body as JSON
    pub json: String,
}

#[derive(Args)]
pub struct CollectionArgs {
    pub collection: String,
}

#[derive(Args)]
pub struct IndexArgs {
    pub collection: String,
    /// Rebuild the index from the stored records first
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(Args)]
pub struct MigrateArgs {
    /// Skip the snapshot normally written to the backups folder
    #[arg(long)]
    pub no_backup: bool,
    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}
