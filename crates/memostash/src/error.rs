use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::codec::Rejection;

/// An error returned by the memoization engine.
///
/// This type is [`Clone`], as a single outcome is shared between every caller that
/// awaits the same in-flight computation.
#[derive(Debug, Clone, Error)]
pub enum MemoError {
    /// The configured cache directory is missing or unusable.
    #[error("invalid cache directory `{}`: {reason}", .path.display())]
    InvalidCacheDir { path: PathBuf, reason: String },
    /// The computation version is neither a non-empty string nor a finite number.
    #[error("invalid computation version: {0}")]
    InvalidVersion(String),
    /// The call arguments could not be turned into a canonical cache key input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The user-supplied computation or post-processing step failed.
    ///
    /// Failures of the computation step are cached just like successful values.
    #[error("computation failed: {0}")]
    Computation(Rejection),
    /// Reading or writing the cache directory failed.
    #[error("cache storage error at `{}`: {source}", .path.display())]
    Storage {
        path: PathBuf,
        source: Arc<io::Error>,
    },
    /// The computed value could not be represented as JSON.
    #[error("failed to encode computation result: {0}")]
    Encoding(String),
    /// A queued call was cleared from its queue before it was flushed.
    #[error("queued computation was discarded before it started")]
    Discarded,
    /// The task driving the computation went away without producing a result.
    #[error("computation was interrupted")]
    Interrupted,
}

impl MemoError {
    /// Wraps an I/O error that happened while operating on `path`.
    pub fn storage(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_owned();
        tracing::error!(path = %path.display(), error = %source, "Cache storage operation failed");
        Self::Storage {
            path,
            source: Arc::new(source),
        }
    }

    /// Returns `true` for errors caused by invalid engine configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidCacheDir { .. } | Self::InvalidVersion(_))
    }

    /// Returns the rejection of a failed computation, if this is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Computation(rejection) => Some(rejection),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MemoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
