//! Deferred, batched calls.
//!
//! A [`Queue`] starts every enqueued call right away, so all cache lookups happen eagerly, but
//! holds back the computations of cache misses until the queue is [flushed](Queue::flush).
//! Flushing reports how many of the queued calls were answered from the cache before any
//! computation starts.

use std::future::IntoFuture;

use futures::channel::oneshot;
use futures::future;

use crate::error::MemoError;
use crate::memoizer::{Call, CacheStatus, Computation, Memoizer};

/// How [`Queue::flush`] waits for the released calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Fail with the first error. The remaining calls keep running.
    #[default]
    FailFast,
    /// Wait for every call and return all individual results.
    CollectAll,
    /// Release the calls and return without waiting for them.
    FireAndForget,
}

/// Cache statistics of one flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchStats {
    pub count: usize,
    pub cache_hit_count: usize,
    pub cache_miss_count: usize,
}

/// The outcome of [`Queue::flush`].
#[derive(Debug)]
pub struct Flushed<T> {
    pub stats: BatchStats,
    /// The results of the flushed calls, in the order they were enqueued.
    ///
    /// Empty for [`FlushMode::FireAndForget`].
    pub results: Vec<Result<T, MemoError>>,
}

impl<T> Flushed<T> {
    fn empty() -> Self {
        Flushed {
            stats: BatchStats::default(),
            results: Vec::new(),
        }
    }
}

struct QueueItem<T> {
    call: Call<T>,
    gate: oneshot::Sender<()>,
}

/// A batch of deferred calls, see the [module docs](self).
///
/// Dropping a queue discards all items that were not flushed.
pub struct Queue<C: Computation> {
    memoizer: Memoizer<C>,
    items: Vec<QueueItem<C::Output>>,
}

impl<C: Computation> Queue<C> {
    pub(crate) fn new(memoizer: Memoizer<C>) -> Self {
        Queue {
            memoizer,
            items: Vec::new(),
        }
    }

    /// Starts a call whose computation waits for the next [`flush`](Self::flush).
    ///
    /// The returned handle resolves once the call completed after a flush, or with
    /// [`MemoError::Discarded`] if the queue is cleared or dropped first.
    pub fn enqueue(&mut self, args: C::Args) -> Result<Call<C::Output>, MemoError> {
        let (gate, wait) = oneshot::channel();
        let call = self.memoizer.start(args, Some(wait))?;
        self.items.push(QueueItem {
            call: call.clone(),
            gate,
        });
        Ok(call)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Discards all pending items.
    ///
    /// Computations of discarded items never run and nothing is persisted for them. Items that
    /// were cache hits are unaffected.
    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            tracing::debug!(count = self.items.len(), "Discarding queued calls");
        }
        self.items.clear();
    }

    /// Waits for all pending cache lookups, then releases the computations.
    ///
    /// The returned [`BatchStats`] are complete before the first computation starts. A call
    /// that failed before it could check the cache counts as a miss.
    pub async fn flush(&mut self, mode: FlushMode) -> Result<Flushed<C::Output>, MemoError> {
        let items = std::mem::take(&mut self.items);
        if items.is_empty() {
            return Ok(Flushed::empty());
        }

        let statuses = future::join_all(items.iter().map(|item| item.call.checked())).await;
        let cache_hit_count = statuses
            .iter()
            .filter(|status| **status == Some(CacheStatus::Hit))
            .count();
        let stats = BatchStats {
            count: items.len(),
            cache_hit_count,
            cache_miss_count: items.len() - cache_hit_count,
        };
        tracing::info!(
            count = stats.count,
            cache_hit_count = stats.cache_hit_count,
            cache_miss_count = stats.cache_miss_count,
            "checked cache"
        );

        let calls: Vec<_> = items
            .into_iter()
            .map(|QueueItem { call, gate }| {
                // the receiver is gone for hits and for calls that joined another in-flight call
                gate.send(()).ok();
                call
            })
            .collect();

        let results = match mode {
            FlushMode::FireAndForget => Vec::new(),
            FlushMode::CollectAll => {
                future::join_all(calls.into_iter().map(IntoFuture::into_future)).await
            }
            FlushMode::FailFast => {
                future::try_join_all(calls.into_iter().map(IntoFuture::into_future))
                    .await?
                    .into_iter()
                    .map(Ok)
                    .collect()
            }
        };

        Ok(Flushed { stats, results })
    }
}
