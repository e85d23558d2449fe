use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::MemoError;

/// The version of the key derivation and record format.
///
/// Bumping this invalidates every existing cache entry of every computation.
pub const FORMAT_VERSION: u32 = 1;

/// The version tag of a computation.
///
/// Changing the version of a computation invalidates all of its previous cache entries.
/// Versions are either text or numbers; the number `1` and the text `"1"` are equivalent.
#[derive(Debug, Clone, PartialEq)]
pub enum Version {
    Text(String),
    Number(f64),
}

impl Version {
    /// Checks that this version can be part of a cache key.
    pub fn validate(&self) -> Result<(), MemoError> {
        match self {
            Self::Text(text) if text.is_empty() => {
                Err(MemoError::InvalidVersion("version must not be empty".into()))
            }
            Self::Number(number) if !number.is_finite() => Err(MemoError::InvalidVersion(
                format!("version must be a finite number, got {number}"),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            // integral numbers print without a fractional part, `2.0` and `2` are the same version
            Self::Number(number) if number.fract() == 0.0 && number.abs() < 1e15 => {
                write!(f, "{}", *number as i64)
            }
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<&str> for Version {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Version {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<f64> for Version {
    fn from(number: f64) -> Self {
        Self::Number(number)
    }
}

impl From<u32> for Version {
    fn from(number: u32) -> Self {
        Self::Number(number.into())
    }
}

impl From<i32> for Version {
    fn from(number: i32) -> Self {
        Self::Number(number.into())
    }
}

/// The key identifying one cache entry.
///
/// A key is the hex-encoded SHA-256 hash of human-readable metadata, which consists of the
/// [`FORMAT_VERSION`], the computation [`Version`], and the canonical input of the call.
/// The metadata is kept around for debugging, but only the hash is used for comparisons.
#[derive(Debug, Clone)]
pub struct CacheKey {
    metadata: Arc<str>,
    hex: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hex == other.hex
    }
}

impl Eq for CacheKey {}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hex.cmp(&other.hex)
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hex.hash(state);
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex)
    }
}

impl CacheKey {
    /// The length of the hex-encoded hash.
    pub const LEN: usize = 64;

    /// Derives the key for a call of the computation with the given `version` and `input`.
    ///
    /// A string `input` is used verbatim, any other value is encoded as JSON first. Object keys
    /// are always serialized in sorted order, so the encoding is canonical.
    pub fn derive(version: &Version, input: &Value) -> Result<Self, MemoError> {
        version.validate()?;

        let mut builder = Self::builder(version);
        builder.write_input(input).map_err(|_| {
            MemoError::InvalidInput("failed to write canonical input".into())
        })?;
        Ok(builder.build())
    }

    /// Creates a [`CacheKeyBuilder`] for the given computation version.
    pub fn builder(version: &Version) -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: format!("memostash/{FORMAT_VERSION}\nversion: {version}\n"),
        }
    }

    /// Parses a key from its hex representation, as found in file names.
    ///
    /// The parsed key has no metadata.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let is_key = hex.len() == Self::LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        is_key.then(|| Self {
            metadata: Arc::from(""),
            hex: Arc::from(hex),
        })
    }

    /// Extracts the key from the name of a record or artifact file.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let hex = name.get(..Self::LEN)?;
        let rest = &name[Self::LEN..];
        if rest.is_empty() || rest.starts_with('.') || rest.starts_with('-') {
            Self::from_hex(hex)
        } else {
            None
        }
    }

    /// Returns the hex-encoded hash.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Returns the human-readable metadata that forms the basis of this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[cfg(test)]
    pub fn for_testing(input: &str) -> Self {
        Self::derive(&Version::from("test"), &Value::from(input)).unwrap()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements [`Write`](std::fmt::Write) to accept additional human readable,
/// but most importantly **stable**, input. Everything written is hashed into the key.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the canonical form of the call input.
    pub fn write_input(&mut self, input: &Value) -> fmt::Result {
        match input {
            Value::String(text) => write!(self.metadata, "input: {text}"),
            other => write!(self.metadata, "input: {other}"),
        }
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(self.metadata.as_bytes());
        let mut hex = String::with_capacity(CacheKey::LEN);
        for b in hash.iter() {
            write!(hex, "{b:02x}").unwrap();
        }

        CacheKey {
            metadata: self.metadata.into(),
            hex: hex.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
pub(crate) fn safe_path_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}
