use clap::Parser;
use std::path::PathBuf;

/// Command-line surface of the extractor binary.
#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel extractor for NTPI phone-firmware archives")]
pub struct Args {
    /// Path to the input .ntpi archive.
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Output directory. Defaults to <input stem>_extracted next to the archive.
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Number of worker threads for file tasks. [0 = auto]
    #[arg(short, long, default_value_t = 0, value_name = "N")]
    pub workers: usize,

    /// Keep the scratch directory after a successful run.
    #[arg(short = 'k', long)]
    pub keep_temp: bool,
}
