//! Exposes the command line application.
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use memostash::config::Config;
use memostash::{CacheKey, CacheStatus, FlushMode, Memoizer, Store, logging};

use crate::digest::FileDigest;
use crate::output;

/// memostash commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// List all entries of the cache directory.
    List {
        /// Print the entries as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the record of a single entry.
    Show {
        /// The cache key, as printed by `list`.
        key: String,
    },

    /// Delete all entries from the cache directory.
    Purge {
        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
    },

    /// Compute the SHA-256 digests of files, reusing digests of unchanged files.
    Digest {
        /// The files to digest.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Afterwards, remove all entries that were not needed for these files.
        #[arg(long)]
        clean: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The cache directory, overriding the one from the configuration file.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application.
pub async fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }

    logging::init_logging(&config);

    let cache_dir = config.cache_dir.clone().context(
        "no cache directory configured, pass `--cache-dir` or set `cache_dir` in the config file",
    )?;
    let store = Store::new(cache_dir);

    match cli.command {
        Command::List { json } => {
            let entries = store.entries()?;
            if json {
                output::print_json(&entries)?;
            } else {
                output::print_entries(&entries);
            }
        }
        Command::Show { key } => {
            let Some(key) = CacheKey::from_hex(&key) else {
                bail!("`{key}` is not a cache key");
            };
            match store.get(&key).await? {
                Some(record) => output::print_json(&record)?,
                None => bail!("no readable record for `{key}`"),
            }
        }
        Command::Purge { dry_run } => {
            let stats = store.purge(dry_run)?;
            output::print_cleanup(&stats, dry_run);
        }
        Command::Digest { files, clean } => {
            let memoizer = Memoizer::from_config(&config, FileDigest)?;
            digest_files(&memoizer, files).await?;
            if clean {
                let stats = memoizer.clean_unused(false)?;
                output::print_cleanup(&stats, false);
            }
        }
    }

    Ok(())
}

async fn digest_files(memoizer: &Memoizer<FileDigest>, files: Vec<PathBuf>) -> Result<()> {
    let mut queue = memoizer.queue();
    let mut calls = Vec::with_capacity(files.len());
    for file in &files {
        calls.push(queue.enqueue(file.clone())?);
    }

    let flushed = queue.flush(FlushMode::CollectAll).await?;
    tracing::debug!(
        hits = flushed.stats.cache_hit_count,
        misses = flushed.stats.cache_miss_count,
        "Digested {} files",
        flushed.stats.count,
    );

    let mut rows = Vec::with_capacity(files.len());
    for ((file, call), result) in files.iter().zip(&calls).zip(flushed.results) {
        let status = call.checked().await.unwrap_or(CacheStatus::Miss);
        rows.push((file.as_path(), status, result));
    }
    output::print_digests(&rows, &flushed.stats);

    Ok(())
}
