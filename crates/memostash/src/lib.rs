//! A disk-backed memoization engine.
//!
//! `memostash` remembers the results of deterministic, versioned computations in a cache
//! directory. A cached result is reused as long as the computation version and its input are
//! the same, and none of the files it read has changed since:
//!
//! ```no_run
//! use futures::future::{BoxFuture, FutureExt};
//! use memostash::{Computation, ComputeContext, Memoizer, Rejection, Version};
//!
//! struct LineCount;
//!
//! impl Computation for LineCount {
//!     type Args = String;
//!     type Output = usize;
//!
//!     fn version(&self) -> Version {
//!         Version::from(1)
//!     }
//!
//!     fn compute<'a>(
//!         &'a self,
//!         ctx: &'a ComputeContext,
//!         path: &'a String,
//!     ) -> BoxFuture<'a, Result<usize, Rejection>> {
//!         async move {
//!             let contents = tokio::fs::read_to_string(ctx.observe(path)).await?;
//!             Ok(contents.lines().count())
//!         }
//!         .boxed()
//!     }
//! }
//!
//! # async fn run() -> Result<(), memostash::MemoError> {
//! let memoizer = Memoizer::new("/tmp/line-counts", LineCount)?;
//! let lines = memoizer.invoke("Cargo.toml".to_owned()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Concurrent calls for the same input share one computation, and [`Queue`] defers the
//! computations of many calls until their cache lookups are complete.

mod cache_key;
mod cleanup;
mod codec;
mod error;
mod fingerprint;
mod memoizer;
mod queue;
mod store;
mod utils;

pub mod config;
pub mod logging;

pub use cache_key::{CacheKey, CacheKeyBuilder, FORMAT_VERSION, Version};
pub use cleanup::CleanupStats;
pub use codec::{ErrorObject, Outcome, Rejection, ResultRecord, round_trip};
pub use error::MemoError;
pub use fingerprint::{Fingerprint, ObservedFile};
pub use memoizer::{ArtifactPaths, CacheStatus, Call, Computation, ComputeContext, Memoizer};
pub use queue::{BatchStats, FlushMode, Flushed, Queue};
pub use store::{EntryInfo, EntryState, Store};
