//! Helpers for testing `memostash` and its computations.
//!
//! Always call [`setup`] at the start of a test to capture logs.

use std::fs;
use std::io;
use std::path::Path;

use filetime::FileTime;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: The logger only captures logs from the `memostash` crate and mutes all
/// other logs. Logs are written to the test output, so they only show for failing tests.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memostash=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to the file at `path`, creating parent directories as needed.
pub fn write_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Moves the modification time of the file at `path` by `seconds`, leaving its contents alone.
///
/// Filesystems with coarse timestamps may not register two writes in quick succession, so
/// tests use this to simulate an edit deterministically.
pub fn touch(path: impl AsRef<Path>, seconds: i64) -> io::Result<()> {
    let path = path.as_ref();
    let mtime = FileTime::from_last_modification_time(&path.metadata()?);
    let moved = FileTime::from_unix_time(mtime.unix_seconds() + seconds, mtime.nanoseconds());
    filetime::set_file_mtime(path, moved)
}
