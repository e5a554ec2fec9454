use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::index::DEFAULT_SPAN;

/// Extension appended to the source name for the default index path.
pub const INDEX_EXTENSION: &str = "gzrx";

#[derive(Parser, Debug)]
#[command(name = "gzseek")]
#[command(version)]
#[command(about = "Random access into gzip files, local or over HTTP", long_about = None)]
#[command(after_help = "Examples:\n  \
  gzseek index big.log.gz                       write big.log.gz.gzrx\n  \
  gzseek extract big.log.gz -b 1000000 -r 200   print 200 bytes from offset 1000000\n  \
  gzseek extract https://example.com/a.gz -I a.gz.gzrx -b 0 -r 4096")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Only print warnings and errors
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an index for a gzip file and save it
    Index {
        /// gzip file path or HTTP URL
        #[arg(value_name = "SOURCE")]
        source: String,

        /// Index file to write (default: SOURCE.gzrx, in the current
        /// directory for URLs)
        #[arg(short = 'o', long, value_name = "INDEX")]
        output: Option<PathBuf>,

        /// Uncompressed bytes between checkpoints
        #[arg(short = 's', long, value_name = "BYTES", default_value_t = DEFAULT_SPAN)]
        span: u64,
    },

    /// Show what an index file contains
    Info {
        #[arg(value_name = "INDEX")]
        index: PathBuf,

        /// List every checkpoint
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Write an uncompressed byte range to stdout
    Extract {
        /// gzip file path or HTTP URL
        #[arg(value_name = "SOURCE")]
        source: String,

        /// First uncompressed byte
        #[arg(short = 'b', long, value_name = "OFFSET")]
        start: u64,

        /// Number of bytes
        #[arg(short = 'r', long, value_name = "BYTES")]
        length: u64,

        /// Index file to use; built and saved first if it does not exist
        #[arg(short = 'I', long, value_name = "INDEX")]
        index: Option<PathBuf>,

        /// Check the whole source against the index checksum first
        #[arg(long)]
        verify: bool,

        /// Give up on a compressed fetch after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

pub fn is_http_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Default sidecar path for `source`.
pub fn default_index_path(source: &str) -> PathBuf {
    let name = if is_http_url(source) {
        let path = source.split(['?', '#']).next().unwrap_or(source);
        match path.rsplit('/').next() {
            Some(last) if !last.is_empty() => last,
            _ => "index",
        }
    } else {
        source
    };
    PathBuf::from(format!("{name}.{INDEX_EXTENSION}"))
}
