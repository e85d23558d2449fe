use std::path::Path;

use anyhow::Result;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, row};
use serde::Serialize;

use memostash::{BatchStats, CacheStatus, CleanupStats, EntryInfo, MemoError};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_entries(entries: &[EntryInfo]) {
    if entries.is_empty() {
        println!("No entries.");
        return;
    }

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Key", "State", "Files", "Artifacts", "Size"]);
    for entry in entries {
        table.add_row(row![
            entry.key,
            entry.state,
            r->entry.observed_files.len(),
            r->entry.artifacts,
            r->entry.size
        ]);
    }
    table.printstd();
}

pub fn print_digests(rows: &[(&Path, CacheStatus, Result<String, MemoError>)], stats: &BatchStats) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "File", "Cache", "Digest"]);
    for (path, status, result) in rows {
        let status = match status {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
        };
        let digest = match result {
            Ok(digest) => digest.clone(),
            Err(err) => format!("error: {err}"),
        };
        table.add_row(row![path.display(), status, digest]);
    }
    table.printstd();

    println!(
        "\n{} files, {} cached, {} computed",
        stats.count, stats.cache_hit_count, stats.cache_miss_count
    );
}

pub fn print_cleanup(stats: &CleanupStats, dry_run: bool) {
    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{verb} {} files and {} directories ({} bytes), retained {} files ({} bytes)",
        stats.removed_files,
        stats.removed_dirs,
        stats.removed_bytes,
        stats.retained_files,
        stats.retained_bytes,
    );
}
