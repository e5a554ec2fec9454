//! Main entry point for the gzseek CLI application.
//!
//! Indexes gzip files and serves byte ranges out of them, from the local
//! filesystem or from HTTP URLs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use gzseek::cli::{Command, default_index_path, is_http_url};
use gzseek::deflate::BlockState;
use gzseek::{
    Cli, ExtractOptions, HttpRangeReader, Index, IndexBuilder, LocalFileReader, RangeExtractor,
    ReadAt, index,
};

/// Application entry point.
///
/// Parses command-line arguments and dispatches to the matching subcommand.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Command::Index {
            source,
            output,
            span,
        } => {
            let reader = Arc::new(Source::open(&source).await?);
            let path = output.unwrap_or_else(|| default_index_path(&source));
            let index = build_and_save(Arc::clone(&reader), span, &path).await?;
            if !cli.quiet {
                eprintln!(
                    "{}: {} checkpoints, {} -> {}",
                    path.display(),
                    index.checkpoints().len(),
                    format_size(index.source_byte_size()),
                    format_size(index.uncompressed_byte_size())
                );
            }
            report_transfer(&reader, cli.quiet);
        }
        Command::Info {
            index: path,
            verbose,
        } => {
            let index = index::load_from_path(&path)
                .await
                .with_context(|| format!("failed to read index {}", path.display()))?;
            print_info(&index, verbose);
        }
        Command::Extract {
            source,
            start,
            length,
            index: index_path,
            verify,
            timeout,
        } => {
            let reader = Arc::new(Source::open(&source).await?);
            let path = index_path.unwrap_or_else(|| default_index_path(&source));

            let index = if path.exists() {
                load_sidecar(&path, &reader)
                    .await
                    .with_context(|| format!("failed to read index {}", path.display()))?
            } else {
                tracing::info!(path = %path.display(), "no index found, building one");
                build_and_save(Arc::clone(&reader), gzseek::DEFAULT_SPAN, &path).await?
            };

            if verify {
                index
                    .verify_source(reader.as_ref())
                    .await
                    .context("source does not match the index, rebuild it")?;
            }

            let options = ExtractOptions {
                fetch_timeout: timeout.map(Duration::from_secs),
            };
            let bytes = RangeExtractor::new(&index, Arc::clone(&reader))
                .with_options(options)
                .extract(start, length)
                .await
                .with_context(|| format!("failed to extract {length} bytes at {start}"))?;

            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
            report_transfer(&reader, cli.quiet);
        }
    }

    Ok(())
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "gzseek=warn" } else { "gzseek=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// A local file or a remote URL.
enum Source {
    Local(LocalFileReader),
    Http(HttpRangeReader),
}

impl Source {
    async fn open(source: &str) -> Result<Self> {
        if is_http_url(source) {
            let reader = HttpRangeReader::new(source.to_string())
                .await
                .with_context(|| format!("failed to open {source}"))?;
            Ok(Source::Http(reader))
        } else {
            let reader = LocalFileReader::new(Path::new(source))?;
            Ok(Source::Local(reader))
        }
    }
}

#[async_trait]
impl ReadAt for Source {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Source::Local(r) => r.read_at(offset, buf).await,
            Source::Http(r) => r.read_at(offset, buf).await,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Source::Local(r) => r.size(),
            Source::Http(r) => r.size(),
        }
    }
}

/// Load an existing index for `source`.
///
/// Local sources are checked in full against the index checksum; remote ones
/// only by size, since a full check means downloading the whole file.
async fn load_sidecar(path: &Path, source: &Source) -> Result<Index> {
    let index = match source {
        Source::Local(local) => index::load_for_source(path, local).await?,
        Source::Http(_) => index::load_from_path(path).await?,
    };
    Ok(index)
}

async fn build_and_save(reader: Arc<Source>, span: u64, path: &Path) -> Result<Index> {
    let index = IndexBuilder::new(span)
        .build(reader)
        .await
        .context("failed to build index")?;
    index::save_to_path(&index, path)
        .await
        .with_context(|| format!("failed to write index {}", path.display()))?;
    Ok(index)
}

/// Display network transfer statistics for HTTP sources.
fn report_transfer(reader: &Source, quiet: bool) {
    if let Source::Http(http) = reader {
        if !quiet {
            eprintln!(
                "Total bytes transferred: {}",
                format_size(http.transferred_bytes())
            );
        }
    }
}

fn print_info(index: &Index, verbose: bool) {
    println!("source size:       {}", index.source_byte_size());
    println!("uncompressed size: {}", index.uncompressed_byte_size());
    println!("source crc32:      {:#010x}", index.source_checksum());
    println!("span:              {}", index.span_bytes());
    println!("members:           {}", index.member_count());
    println!("checkpoints:       {}", index.checkpoints().len());

    if verbose {
        println!();
        println!(
            "{:>6}  {:>14}  {:>16}  {:>6}  {:>8}  {:>6}",
            "#", "Offset", "Bit offset", "Member", "Block", "Window"
        );
        println!("{}", "-".repeat(66));
        for (i, cp) in index.checkpoints().iter().enumerate() {
            let block = match cp.block {
                BlockState::Boundary => "boundary",
                BlockState::Stored { .. } => "stored",
                BlockState::Fixed { .. } => "fixed",
                BlockState::Dynamic { .. } => "dynamic",
            };
            println!(
                "{:>6}  {:>14}  {:>16}  {:>6}  {:>8}  {:>6}",
                i,
                cp.uncompressed_offset,
                cp.compressed_bit_offset,
                cp.member_id,
                block,
                cp.window.len()
            );
        }
    }
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
