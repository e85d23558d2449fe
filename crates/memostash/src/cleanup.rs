//! Garbage collection of cache entries.
//!
//! An engine remembers every key it looked up. Entries with any other key were not needed by
//! this engine instance and can be removed with [`Memoizer::clean_unused`]. Run it after all
//! calls were started, otherwise entries of calls that are still to come are removed as well.

use std::collections::HashSet;

use crate::cache_key::CacheKey;
use crate::error::MemoError;
use crate::memoizer::{Computation, Memoizer};
use crate::store::{EntryFile, Store, catch_not_found};

/// The files and directories removed or kept by a cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl CleanupStats {
    fn record_removed(&mut self, file: &EntryFile, size: u64) {
        if file.is_dir {
            self.removed_dirs += 1;
        } else {
            self.removed_files += 1;
        }
        self.removed_bytes += size;
    }

    fn record_retained(&mut self, file: &EntryFile, size: u64) {
        if file.is_dir {
            self.retained_dirs += 1;
        } else {
            self.retained_files += 1;
        }
        self.retained_bytes += size;
    }

    fn log(&self) {
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            self.retained_dirs,
            self.retained_files,
            self.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            self.removed_dirs,
            self.removed_files,
            self.removed_bytes
        );
    }
}

impl Store {
    /// Removes every entry whose key is not in `used`, including all of its artifacts.
    ///
    /// Files that do not belong to an entry are left alone. If `dry_run` is `true`, nothing is
    /// actually deleted. Failing to remove a single file is logged and does not stop the run.
    pub fn remove_unused(
        &self,
        used: &HashSet<CacheKey>,
        dry_run: bool,
    ) -> Result<CleanupStats, MemoError> {
        tracing::info!("Cleaning up cache directory `{}`", self.root().display());

        let mut stats = CleanupStats::default();
        for file in self.scan()? {
            tracing::trace!("Checking file `{}`", file.path.display());
            let size = match file.disk_usage() {
                Ok(size) => size,
                Err(e) => {
                    tracing::error!(path = %file.path.display(), "Failed to stat cache file: {:?}", e);
                    0
                }
            };

            if used.contains(&file.key) {
                stats.record_retained(&file, size);
                continue;
            }

            tracing::debug!("Removing file `{}`", file.path.display());
            if !dry_run {
                if let Err(e) = catch_not_found(|| file.remove()) {
                    tracing::error!(path = %file.path.display(), "Failed to clean cache file: {:?}", e);
                    stats.record_retained(&file, size);
                    continue;
                }
            }
            stats.record_removed(&file, size);
        }

        tracing::info!("Cleaning up `{}` complete", self.root().display());
        stats.log();
        Ok(stats)
    }

    /// Removes every entry in the cache directory.
    pub fn purge(&self, dry_run: bool) -> Result<CleanupStats, MemoError> {
        self.remove_unused(&HashSet::new(), dry_run)
    }
}

impl<C: Computation> Memoizer<C> {
    /// Removes all entries that were not looked up by this engine.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn clean_unused(&self, dry_run: bool) -> Result<CleanupStats, MemoError> {
        self.store().remove_unused(&self.used_keys(), dry_run)
    }

    /// Removes all entries, used or not.
    pub fn purge(&self) -> Result<CleanupStats, MemoError> {
        self.store().purge(false)
    }
}
