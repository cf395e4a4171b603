//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// gfs - Generic filesystem access
///
/// Reads and manages files on local disk, HTTP(S), FTP, S3 and GCS
/// through one interface, caching remote reads block by block.
#[derive(Parser, Debug)]
#[command(name = "gfs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "GFS_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write file contents to stdout
    Cat(CatArgs),

    /// Show file metadata
    Stat(StatArgs),

    /// List a directory
    Ls(LsArgs),

    /// Copy a file, across backends if needed
    Cp(CopyArgs),

    /// Move or rename a file
    Mv(MoveArgs),

    /// Remove a file or directory
    Rm(RmArgs),

    /// Create a directory
    Mkdir(MkdirArgs),

    /// Fetch a file into the cache and print its local path
    Fetch(FetchArgs),

    /// Manage the block cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the cat command
#[derive(Parser, Debug)]
pub struct CatArgs {
    /// Path or URL
    pub path: String,

    /// Start reading at this byte offset
    #[arg(long, default_value = "0")]
    pub offset: u64,

    /// Read at most this many bytes
    #[arg(short = 'n', long)]
    pub length: Option<u64>,
}

/// Arguments for the stat command
#[derive(Parser, Debug)]
pub struct StatArgs {
    /// Path or URL
    pub path: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the ls command
#[derive(Parser, Debug)]
pub struct LsArgs {
    /// Directory path or URL
    pub path: String,

    /// Output format
    #[arg(short, long, default_value = "plain")]
    pub format: OutputFormat,
}

/// Arguments for the cp command
#[derive(Parser, Debug)]
pub struct CopyArgs {
    /// Source path or URL
    pub src: String,

    /// Destination path or URL
    pub dst: String,
}

/// Arguments for the mv command
#[derive(Parser, Debug)]
pub struct MoveArgs {
    /// Source path or URL
    pub src: String,

    /// Destination path or URL
    pub dst: String,
}

/// Arguments for the rm command
#[derive(Parser, Debug)]
pub struct RmArgs {
    /// Path or URL
    pub path: String,

    /// Remove directories and their contents
    #[arg(short, long)]
    pub recursive: bool,

    /// Ignore errors while removing recursively
    #[arg(short, long, requires = "recursive")]
    pub force: bool,
}

/// Arguments for the mkdir command
#[derive(Parser, Debug)]
pub struct MkdirArgs {
    /// Directory path or URL
    pub path: String,

    /// Create missing parents, succeed if the directory exists
    #[arg(short, long)]
    pub parents: bool,
}

/// Arguments for the fetch command
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Path or URL
    pub path: String,
}

/// Output format for stat and ls
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show the cache directory
    Path,

    /// Purge stale blocks and evict entries over the size budget
    Clean {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Drop the cache entry for one URL
    Purge {
        /// URL whose entry is removed
        url: String,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}
