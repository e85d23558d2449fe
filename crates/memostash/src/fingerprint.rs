//! Cheap file change detection.
//!
//! A [`Fingerprint`] is derived from file metadata only: the size, the modification time and,
//! where the platform reports it, the creation time. The file contents are never read, so taking
//! a fingerprint is a single `stat` call regardless of the file size.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A comparison token describing the state of a file.
///
/// Two fingerprints are compared for equality only; there is no notion of "newer".
/// A file that does not exist has the distinct [`Fingerprint::MISSING`] token, which is
/// serialized as `null`. A file appearing where there was none before is thus a change as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Option<String>);

impl Fingerprint {
    /// The fingerprint of a file that does not exist.
    pub const MISSING: Self = Self(None);

    /// Takes the fingerprint of the file at `path`.
    ///
    /// This never fails: a file that cannot be inspected is recorded as missing.
    pub fn of(path: &Path) -> Self {
        match path.metadata() {
            Ok(metadata) => Self::from_metadata(&metadata),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        path = %path.display(),
                        error = %err,
                        "Could not stat observed file, treating it as missing"
                    );
                }
                Self::MISSING
            }
        }
    }

    /// Creates the fingerprint from already loaded file metadata.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mtime = FileTime::from_last_modification_time(metadata);
        let btime = match FileTime::from_creation_time(metadata) {
            Some(btime) => format_time(btime),
            None => "-".to_owned(),
        };
        Self(Some(format!(
            "{}:{}:{}",
            metadata.len(),
            format_time(mtime),
            btime
        )))
    }

    /// Whether this is the fingerprint of a missing file.
    pub fn is_missing(&self) -> bool {
        self.0.is_none()
    }

    /// The raw comparison token, or `None` for missing files.
    pub fn as_token(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

fn format_time(time: FileTime) -> String {
    format!("{}.{:09}", time.seconds(), time.nanoseconds())
}

/// A file that was read by a computation, together with its fingerprint at that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedFile {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl ObservedFile {
    /// Records the current state of the file at `path`.
    pub fn observe(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let fingerprint = Fingerprint::of(&path);
        Self { path, fingerprint }
    }

    /// Checks whether the file still has the recorded fingerprint.
    pub fn is_unchanged(&self) -> bool {
        Fingerprint::of(&self.path) == self.fingerprint
    }
}

/// The ordered set of files observed during one computation.
///
/// Observing the same path twice keeps its original position and refreshes its fingerprint.
#[derive(Debug, Default)]
pub(crate) struct ObservedFiles {
    files: Mutex<Vec<ObservedFile>>,
}

impl ObservedFiles {
    pub fn record(&self, path: &Path) {
        let observed = ObservedFile::observe(path);
        let mut files = self.files.lock();
        match files.iter_mut().find(|file| file.path == observed.path) {
            Some(existing) => existing.fingerprint = observed.fingerprint,
            None => files.push(observed),
        }
    }

    pub fn into_inner(self) -> Vec<ObservedFile> {
        self.files.into_inner()
    }
}
