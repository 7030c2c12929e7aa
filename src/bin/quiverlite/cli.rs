use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Admin CLI for QuiverLite storage files
#[derive(Parser, Debug)]
#[command(name = "quiverlite", version, about = "QuiverLite storage CLI", arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Таблица для put: создаётся с этими параметрами, если её ещё нет.
#[derive(Debug, Clone)]
pub struct TableArg {
    pub name: String,
    pub hash: bool,
    pub key_size: usize,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a new database file (header page only)
    Init {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 4096)]
        page_size: usize,
        /// Fixed salt (random by default)
        #[arg(long)]
        salt: Option<u32>,
        /// Replace an existing database at the path
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Put key/value into a table (table is created on first use)
    Put {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "default")]
        table: String,
        /// Create the table as a hash table
        #[arg(long, default_value_t = false)]
        hash: bool,
        /// Fixed key size for a new table (0 = variable)
        #[arg(long, default_value_t = 0)]
        key_size: usize,
        #[arg(long)]
        key: String,
        /// Value: literal, hex:..., @file or - for stdin. Ignored if --value-file is set.
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        value_file: Option<PathBuf>,
    },
    /// Get key
    Get {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "default")]
        table: String,
        #[arg(long)]
        key: String,
        /// Optional file to write raw value into
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete key
    Del {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "default")]
        table: String,
        #[arg(long)]
        key: String,
    },
    /// Scan a table in key order (bucket order for hash tables)
    Scan {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "default")]
        table: String,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long, default_value_t = false)]
        reverse: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List tables
    Tables {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Drop a table with all its pages
    DropTable {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        table: String,
    },
    /// Storage statistics (header, free set, views, metrics)
    Stat {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Force a checkpoint
    Checkpoint {
        #[arg(long)]
        path: PathBuf,
    },
    /// Rewrite the file compactly
    Vacuum {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
