//! The on-disk layout of a cache directory.
//!
//! A cache directory is flat. Every entry consists of one record file named `<key>.json` and any
//! number of artifacts named `<key>-<label>`, which may be files or directories. Temporary files
//! created while writing records start with `.tmp` and are never mistaken for entries.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cache_key::{CacheKey, safe_path_segment};
use crate::codec::{Outcome, ResultRecord};
use crate::error::MemoError;
use crate::fingerprint::ObservedFile;

/// Read and write access to the entries of one cache directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the record file of `key`.
    pub fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// The path of the artifact `label` belonging to `key`.
    ///
    /// The label is sanitized into a single path segment, so the artifact always lives directly
    /// inside the cache directory.
    pub fn cache_path(&self, key: &CacheKey, label: &str) -> PathBuf {
        self.root.join(format!("{key}-{}", safe_path_segment(label)))
    }

    /// Creates the cache directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), MemoError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(MemoError::InvalidCacheDir {
                    path: self.root.clone(),
                    reason: "path exists and is not a directory".into(),
                });
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(MemoError::storage(&self.root, err)),
        }

        tracing::debug!(path = %self.root.display(), "Creating cache directory");
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| MemoError::storage(&self.root, err))
    }

    /// Loads the record of `key`.
    ///
    /// A missing record is `Ok(None)`. So is a record that cannot be parsed, which is logged and
    /// then treated like any other cache miss.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<ResultRecord>, MemoError> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MemoError::storage(&path, err)),
        };

        match ResultRecord::from_bytes(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Ignoring unreadable cache record"
                );
                Ok(None)
            }
        }
    }

    /// Atomically writes the encoded record of `key`.
    ///
    /// The bytes are written to a temporary file in the cache directory first, which is then
    /// renamed over the record. Concurrent readers see either the old or the new record.
    pub async fn put(&self, key: &CacheKey, bytes: Vec<u8>) -> Result<(), MemoError> {
        let root = self.root.clone();
        let path = self.record_path(key);

        tracing::trace!(path = %path.display(), len = bytes.len(), "Writing cache record");
        match tokio::task::spawn_blocking(move || write_atomic(&root, &path, &bytes)).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "Cache write task failed");
                Err(MemoError::Interrupted)
            }
        }
    }

    /// Lists the keys of every entry in the cache directory, in key order.
    pub fn list(&self) -> Result<Vec<CacheKey>, MemoError> {
        let mut keys: Vec<_> = self.scan()?.into_iter().map(|file| file.key).collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Removes the record of `key` along with all of its artifacts.
    ///
    /// Returns the number of removed files and directories.
    pub fn delete(&self, key: &CacheKey) -> Result<usize, MemoError> {
        let mut removed = 0;
        for file in self.scan()? {
            if file.key != *key {
                continue;
            }
            tracing::debug!(path = %file.path.display(), "Removing cache file");
            if catch_not_found(|| file.remove())
                .map_err(|err| MemoError::storage(&file.path, err))?
                .is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Describes every entry in the cache directory, in key order.
    pub fn entries(&self) -> Result<Vec<EntryInfo>, MemoError> {
        let mut entries = BTreeMap::<CacheKey, EntryInfo>::new();

        for file in self.scan()? {
            let size = file
                .disk_usage()
                .map_err(|err| MemoError::storage(&file.path, err))?;
            let entry = entries
                .entry(file.key.clone())
                .or_insert_with(|| EntryInfo {
                    key: file.key.clone(),
                    state: EntryState::Incomplete,
                    observed_files: Vec::new(),
                    artifacts: 0,
                    size: 0,
                });
            entry.size += size;

            if !file.is_record() {
                entry.artifacts += 1;
                continue;
            }

            let record = catch_not_found(|| fs::read(&file.path))
                .map_err(|err| MemoError::storage(&file.path, err))?
                .map(|bytes| ResultRecord::from_bytes(&bytes));
            match record {
                Some(Ok(record)) => {
                    entry.state = match record.outcome {
                        Outcome::Fulfilled { .. } => EntryState::Fulfilled,
                        Outcome::Rejected { .. } => EntryState::Rejected,
                    };
                    entry.observed_files = record.observed_files;
                }
                Some(Err(_)) => entry.state = EntryState::Unreadable,
                None => {}
            }
        }

        Ok(entries.into_values().collect())
    }

    /// Lists every key-shaped file and directory in the cache directory.
    ///
    /// A missing cache directory has no entries.
    pub(crate) fn scan(&self) -> Result<Vec<EntryFile>, MemoError> {
        let read_dir = match catch_not_found(|| fs::read_dir(&self.root))
            .map_err(|err| MemoError::storage(&self.root, err))?
        {
            Some(read_dir) => read_dir,
            None => {
                tracing::debug!(path = %self.root.display(), "Cache directory does not exist");
                return Ok(Vec::new());
            }
        };

        let mut files = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|err| MemoError::storage(&self.root, err))?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(CacheKey::from_file_name) else {
                tracing::trace!(name = ?name, "Skipping foreign file in cache directory");
                continue;
            };
            let is_dir = entry.file_type().is_ok_and(|ty| ty.is_dir());
            files.push(EntryFile {
                key,
                path: entry.path(),
                is_dir,
            });
        }
        Ok(files)
    }
}

/// A file or directory in the cache directory that belongs to an entry.
#[derive(Debug)]
pub(crate) struct EntryFile {
    pub key: CacheKey,
    pub path: PathBuf,
    pub is_dir: bool,
}

impl EntryFile {
    fn is_record(&self) -> bool {
        !self.is_dir
            && self
                .path
                .extension()
                .is_some_and(|ext| ext == "json")
            && self
                .path
                .file_stem()
                .is_some_and(|stem| stem.len() == CacheKey::LEN)
    }

    /// The total size of this file, or of all files below this directory.
    pub fn disk_usage(&self) -> io::Result<u64> {
        if self.is_dir {
            dir_usage(&self.path)
        } else {
            Ok(catch_not_found(|| self.path.metadata())?.map_or(0, |m| m.len()))
        }
    }

    pub fn remove(&self) -> io::Result<()> {
        if self.is_dir {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        }
    }
}

fn dir_usage(path: &Path) -> io::Result<u64> {
    let Some(read_dir) = catch_not_found(|| fs::read_dir(path))? else {
        return Ok(0);
    };
    let mut size = 0;
    for entry in read_dir {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += dir_usage(&entry.path())?;
        } else {
            size += metadata.len();
        }
    }
    Ok(size)
}

/// The state of a cache entry as shown by [`Store::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Fulfilled,
    Rejected,
    /// The record exists but cannot be parsed.
    Unreadable,
    /// There are artifacts, but no record.
    Incomplete,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
            Self::Unreadable => "unreadable",
            Self::Incomplete => "incomplete",
        })
    }
}

/// A summary of one cache entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryInfo {
    pub key: CacheKey,
    pub state: EntryState,
    pub observed_files: Vec<ObservedFile>,
    /// The number of artifacts stored next to the record.
    pub artifacts: usize,
    /// The size of the record and all artifacts, in bytes.
    pub size: u64,
}

fn write_atomic(root: &Path, path: &Path, bytes: &[u8]) -> Result<(), MemoError> {
    // A concurrent cleanup may remove the cache directory underneath us, so retry a few times.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(root) {
            tracing::warn!(path = %root.display(), "Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(MemoError::storage(root, e));
            }
            continue;
        }

        let mut temp_file = match tempfile::Builder::new().prefix(".tmp").tempfile_in(root) {
            Ok(temp_file) => temp_file,
            Err(e) => {
                tracing::warn!(path = %root.display(), "Failed to create temp file: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(MemoError::storage(root, e));
                }
                continue;
            }
        };

        temp_file
            .write_all(bytes)
            .and_then(|_| temp_file.flush())
            .map_err(|e| MemoError::storage(temp_file.path(), e))?;

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to persist cache record: {:?}", e.error);
                if retries > MAX_RETRIES {
                    return Err(MemoError::storage(path, e.error));
                }
            }
        }
    }
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
