use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Report listing JSON file, or `-` for stdin
    #[arg(short, long, global = true)]
    pub listing: Option<PathBuf>,

    /// Base directory for reports, overriding the config file
    #[arg(short, long, global = true)]
    pub directory: Option<PathBuf>,

    /// Number of concurrent transfers
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Retention window such as 16h, 2d or weekly
    #[arg(short, long, global = true)]
    pub retention: Option<String>,

    /// Keep only reports of these 6-hour periods (1-4)
    #[arg(long = "report-number", value_delimiter = ',', global = true)]
    pub report_numbers: Vec<u8>,

    /// Keep only these positions of the newest-first report list (1 = newest)
    #[arg(long, value_delimiter = ',', global = true, conflicts_with = "report_numbers")]
    pub recent: Vec<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the reports of the listing
    List {
        /// Also print each file's destination and size
        #[arg(long)]
        detailed: bool,
    },
    /// Fetch file sizes without downloading
    Probe,
    /// Download every report file not yet in the index
    Download,
    /// Delete files older than the retention window
    Prune,
}
