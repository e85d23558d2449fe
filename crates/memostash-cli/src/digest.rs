use std::path::PathBuf;

use futures::future::{BoxFuture, FutureExt};
use serde::ser::Error as _;
use sha2::{Digest, Sha256};

use memostash::{Computation, ComputeContext, Rejection, Version};

/// The SHA-256 digest of a file, as a lowercase hex string.
///
/// Files are identified by their absolute path, so the same file reached through different
/// relative paths shares one entry.
pub struct FileDigest;

impl Computation for FileDigest {
    type Args = PathBuf;
    type Output = String;

    fn version(&self) -> Version {
        Version::from(1)
    }

    fn select_input(&self, path: &PathBuf) -> Result<serde_json::Value, serde_json::Error> {
        let path = std::path::absolute(path).map_err(serde_json::Error::custom)?;
        serde_json::to_value(path)
    }

    fn compute<'a>(
        &'a self,
        ctx: &'a ComputeContext,
        path: &'a PathBuf,
    ) -> BoxFuture<'a, Result<String, Rejection>> {
        async move {
            let path = std::path::absolute(path)?;
            let contents = tokio::fs::read(ctx.observe(&path)).await?;
            tracing::debug!(path = %path.display(), len = contents.len(), "Hashing file");
            Ok(format!("{:x}", Sha256::digest(&contents)))
        }
        .boxed()
    }
}
