//! The memoization engine.
//!
//! A [`Memoizer`] wraps one [`Computation`] and a cache directory. Every call goes through the
//! same pipeline, which runs on its own spawned task:
//!
//! 1. The cache directory is created, once per engine.
//! 2. The record of the call's [`CacheKey`] is loaded. A record is only used if all of the files
//!    the computation observed are unchanged.
//! 3. On a miss, the computation runs and its outcome (value or rejection) is persisted.
//! 4. Successful values are post-processed before they are handed out.
//!
//! Concurrent calls with the same key share a single pipeline.

use std::collections::{BTreeMap, HashSet};
use std::future::IntoFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::cache_key::{CacheKey, Version};
use crate::codec::{Rejection, ResultRecord};
use crate::config::Config;
use crate::error::MemoError;
use crate::fingerprint::ObservedFiles;
use crate::queue::Queue;
use crate::store::Store;
use crate::utils::CallOnDrop;

/// A deterministic, versioned computation that can be memoized.
///
/// The result of [`compute`](Self::compute) must only depend on the cache input selected from
/// its arguments, on the [`version`](Self::version), and on the contents of files the computation
/// reports through [`ComputeContext::observe`]. Changing the computation in any other way
/// requires a new version.
pub trait Computation: Send + Sync + 'static {
    /// The arguments of one call.
    type Args: Serialize + Send + Sync + 'static;
    /// The value produced by a successful call.
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// The version of this computation.
    fn version(&self) -> Version;

    /// Selects the part of the arguments that identifies a call.
    ///
    /// Defaults to all of the arguments. Override this to leave out arguments that do not
    /// influence the result, or to substitute surrogates for large ones.
    fn select_input(&self, args: &Self::Args) -> Result<Value, serde_json::Error> {
        serde_json::to_value(args)
    }

    /// Computes the value for a call that was not found in the cache.
    ///
    /// Failures are cached like values.
    fn compute<'a>(
        &'a self,
        ctx: &'a ComputeContext,
        args: &'a Self::Args,
    ) -> BoxFuture<'a, Result<Self::Output, Rejection>>;

    /// Transforms a successful value before it is returned, for cached and fresh values alike.
    ///
    /// The transformed value is never persisted, so this is the place to turn references to
    /// cached artifacts into something live, like an opened file.
    fn post_process<'a>(
        &'a self,
        _paths: &'a ArtifactPaths,
        _args: &'a Self::Args,
        value: Self::Output,
    ) -> BoxFuture<'a, Result<Self::Output, Rejection>> {
        futures::future::ready(Ok(value)).boxed()
    }

    /// Whether fresh values go through an encode/decode cycle before they are returned.
    ///
    /// With this enabled, a fresh value is indistinguishable from a cached one.
    ///
    /// A value whose JSON form cannot be read back as `Output` is cached as an `EncodingError`
    /// rejection. This affects non-finite floats in particular: JSON stores them as `null`, so
    /// a bare `f64` output of `NaN` is rejected while `Option<f64>` reads back as `None`.
    fn output_consistency(&self) -> bool {
        true
    }
}

/// Locations for artifacts belonging to one cache entry.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    store: Store,
    key: CacheKey,
}

impl ArtifactPaths {
    /// The path at which the artifact named `label` is stored.
    ///
    /// Artifacts are removed along with the record of their entry.
    pub fn cache_path(&self, label: &str) -> PathBuf {
        self.store.cache_path(&self.key, label)
    }

    /// The key of the entry.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// The capabilities handed to [`Computation::compute`].
#[derive(Debug)]
pub struct ComputeContext {
    paths: ArtifactPaths,
    observed: ObservedFiles,
}

impl ComputeContext {
    /// Declares that the computation depends on the file at `path`.
    ///
    /// Records the current fingerprint of the file and returns the path. The cached result is
    /// discarded as soon as the file changes, appears or disappears. Observe a file before
    /// reading it, so that changes made while reading invalidate the entry.
    pub fn observe(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.observed.record(path);
        path.to_owned()
    }

    /// See [`ArtifactPaths::cache_path`].
    pub fn cache_path(&self, label: &str) -> PathBuf {
        self.paths.cache_path(label)
    }

    /// The artifact locations of the entry being computed.
    pub fn artifacts(&self) -> &ArtifactPaths {
        &self.paths
    }
}

/// Whether a call was answered from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

type CheckChannel = Shared<oneshot::Receiver<CacheStatus>>;
type ResultChannel<T> = Shared<oneshot::Receiver<Result<T, MemoError>>>;
type InFlightMap<T> = Arc<Mutex<BTreeMap<CacheKey, InFlight<T>>>>;

#[derive(Clone)]
struct InFlight<T> {
    checked: CheckChannel,
    result: ResultChannel<T>,
}

/// A handle to a started call.
///
/// The call makes progress whether or not this handle is awaited. Awaiting it yields the
/// final result.
#[derive(Clone)]
pub struct Call<T> {
    key: CacheKey,
    flight: InFlight<T>,
}

impl<T> std::fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("key", &self.key).finish()
    }
}

impl<T: Clone> Call<T> {
    /// The cache key of this call.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits until the cache was checked for this call.
    ///
    /// This resolves before the computation starts. Returns `None` if the call failed before
    /// it could check the cache.
    pub async fn checked(&self) -> Option<CacheStatus> {
        self.flight.checked.clone().await.ok()
    }
}

impl<T> IntoFuture for Call<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, MemoError>;
    type IntoFuture = BoxFuture<'static, Result<T, MemoError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.flight
            .result
            .unwrap_or_else(|_cancelled| Err(MemoError::Interrupted))
            .boxed()
    }
}

/// Memoizes a [`Computation`] in a cache directory.
///
/// Cloning is cheap, and clones share their in-flight calls and the set of used keys.
pub struct Memoizer<C: Computation> {
    computation: Arc<C>,
    version: Version,
    store: Store,
    root_ready: Arc<OnceCell<Result<(), MemoError>>>,
    in_flight: InFlightMap<C::Output>,
    used_keys: Arc<Mutex<HashSet<CacheKey>>>,
}

impl<C: Computation> Clone for Memoizer<C> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Memoizer {
            computation: Arc::clone(&self.computation),
            version: self.version.clone(),
            store: self.store.clone(),
            root_ready: Arc::clone(&self.root_ready),
            in_flight: Arc::clone(&self.in_flight),
            used_keys: Arc::clone(&self.used_keys),
        }
    }
}

impl<C: Computation> std::fmt::Debug for Memoizer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoizer")
            .field("version", &self.version)
            .field("cache_dir", &self.store.root())
            .finish_non_exhaustive()
    }
}

impl<C: Computation> Memoizer<C> {
    /// Creates an engine memoizing `computation` in `cache_dir`.
    ///
    /// The directory does not need to exist yet, it is created by the first call.
    pub fn new(cache_dir: impl Into<PathBuf>, computation: C) -> Result<Self, MemoError> {
        let cache_dir = cache_dir.into();
        if cache_dir.as_os_str().is_empty() {
            return Err(MemoError::InvalidCacheDir {
                path: cache_dir,
                reason: "path must not be empty".into(),
            });
        }
        if cache_dir.exists() && !cache_dir.is_dir() {
            return Err(MemoError::InvalidCacheDir {
                path: cache_dir,
                reason: "path exists and is not a directory".into(),
            });
        }

        let version = computation.version();
        version.validate()?;

        Ok(Memoizer {
            computation: Arc::new(computation),
            version,
            store: Store::new(cache_dir),
            root_ready: Arc::new(OnceCell::new()),
            in_flight: Arc::new(Mutex::new(BTreeMap::new())),
            used_keys: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Creates an engine using the cache directory from `config`.
    pub fn from_config(config: &Config, computation: C) -> Result<Self, MemoError> {
        let cache_dir = config
            .cache_dir
            .clone()
            .ok_or_else(|| MemoError::InvalidCacheDir {
                path: PathBuf::new(),
                reason: "no cache directory configured".into(),
            })?;
        Self::new(cache_dir, computation)
    }

    pub fn computation(&self) -> &C {
        &self.computation
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Computes the cache key for the given arguments, without starting a call.
    pub fn cache_key(&self, args: &C::Args) -> Result<CacheKey, MemoError> {
        let input = self
            .computation
            .select_input(args)
            .map_err(|err| MemoError::InvalidInput(err.to_string()))?;
        CacheKey::derive(&self.version, &input)
    }

    /// Calls the computation and waits for its result.
    pub async fn invoke(&self, args: C::Args) -> Result<C::Output, MemoError> {
        self.call(args)?.await
    }

    /// Starts a call of the computation.
    ///
    /// The call is spawned on the current tokio runtime right away and runs to completion even
    /// if the returned handle is dropped. If a call with the same key is still running, its
    /// handle is shared instead.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn call(&self, args: C::Args) -> Result<Call<C::Output>, MemoError> {
        self.start(args, None)
    }

    /// Creates a [`Queue`] for batched calls.
    pub fn queue(&self) -> Queue<C> {
        Queue::new(self.clone())
    }

    /// Starts a call, optionally deferring its computation until `gate` fires.
    ///
    /// Dropping the sending half of `gate` discards the call if it misses the cache.
    pub(crate) fn start(
        &self,
        args: C::Args,
        gate: Option<oneshot::Receiver<()>>,
    ) -> Result<Call<C::Output>, MemoError> {
        let key = self.cache_key(&args)?;
        self.used_keys.lock().insert(key.clone());

        let mut in_flight = self.in_flight.lock();
        if let Some(flight) = in_flight.get(&key) {
            // A concurrent call was deduplicated.
            tracing::trace!(%key, "Joining in-flight computation");
            return Ok(Call {
                key,
                flight: flight.clone(),
            });
        }

        let (checked_sender, checked) = oneshot::channel();
        let (result_sender, result) = oneshot::channel();
        let flight = InFlight {
            checked: checked.shared(),
            result: result.shared(),
        };
        let evicted = in_flight.insert(key.clone(), flight.clone());
        debug_assert!(evicted.is_none());
        drop(in_flight);

        let remove_computation_token = {
            let in_flight = Arc::clone(&self.in_flight);
            let key = key.clone();
            CallOnDrop::new(move || {
                in_flight.lock().remove(&key);
            })
        };

        let span = tracing::debug_span!("memoize", key = %key);
        let pipeline = self
            .clone()
            .run(key.clone(), args, checked_sender, gate);
        tokio::spawn(
            async move {
                let result = pipeline.await;
                // Drop the token first to evict from the map. This ensures that callers either
                // get a channel that will receive data, or they start a new call.
                drop(remove_computation_token);
                result_sender.send(result).ok();
            }
            .instrument(span),
        );

        Ok(Call { key, flight })
    }

    async fn run(
        self,
        key: CacheKey,
        args: C::Args,
        checked: oneshot::Sender<CacheStatus>,
        gate: Option<oneshot::Receiver<()>>,
    ) -> Result<C::Output, MemoError> {
        self.root_ready
            .get_or_init(|| self.store.ensure_root())
            .await
            .clone()?;

        let paths = ArtifactPaths {
            store: self.store.clone(),
            key: key.clone(),
        };

        if let Some(cached) = self.lookup(&key).await? {
            tracing::debug!("cache hit");
            checked.send(CacheStatus::Hit).ok();
            return self.finish(&paths, &args, cached).await;
        }

        tracing::debug!("cache miss");
        checked.send(CacheStatus::Miss).ok();

        if let Some(gate) = gate {
            if gate.await.is_err() {
                tracing::debug!("Discarding queued computation");
                return Err(MemoError::Discarded);
            }
        }

        let ctx = ComputeContext {
            paths: paths.clone(),
            observed: ObservedFiles::default(),
        };
        let result = self.computation.compute(&ctx, &args).await;
        if let Err(ref rejection) = result {
            tracing::debug!(%rejection, "Computation rejected, caching the rejection");
        }

        let record = ResultRecord::from_result(&result, ctx.observed.into_inner())?;
        let mut bytes = record.to_bytes()?;
        let decoded = match ResultRecord::from_bytes(&bytes)?.into_result() {
            Ok(decoded) => decoded,
            Err(err) => {
                // The encoded value no longer fits the output type, e.g. a NaN `f64` stored as
                // `null`. Cache the failure, so the entry still answers later calls.
                tracing::warn!(error = %err, "Computed value does not survive encoding");
                let rejection = Err(Rejection::error("EncodingError", err.to_string()));
                bytes = ResultRecord::from_result(&rejection, record.observed_files)?.to_bytes()?;
                rejection
            }
        };
        let result = if self.computation.output_consistency() {
            decoded
        } else {
            result
        };

        let (stored, finished) = futures::join!(
            self.store.put(&key, bytes),
            self.finish(&paths, &args, result)
        );
        stored?;
        finished
    }

    /// Loads a still valid result from the cache.
    async fn lookup(
        &self,
        key: &CacheKey,
    ) -> Result<Option<Result<C::Output, Rejection>>, MemoError> {
        let Some(record) = self.store.get(key).await? else {
            tracing::trace!("No cache record");
            return Ok(None);
        };

        if let Some(changed) = record.changed_file() {
            tracing::debug!(path = %changed.path.display(), "Observed file changed");
            return Ok(None);
        }

        match record.into_result() {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                tracing::warn!(error = %err, "Cached value does not fit the computation output");
                Ok(None)
            }
        }
    }

    async fn finish(
        &self,
        paths: &ArtifactPaths,
        args: &C::Args,
        result: Result<C::Output, Rejection>,
    ) -> Result<C::Output, MemoError> {
        match result {
            Ok(value) => self
                .computation
                .post_process(paths, args, value)
                .await
                .map_err(MemoError::Computation),
            Err(rejection) => Err(MemoError::Computation(rejection)),
        }
    }

    /// Returns the keys looked up by this engine so far.
    pub fn used_keys(&self) -> HashSet<CacheKey> {
        self.used_keys.lock().clone()
    }
}
