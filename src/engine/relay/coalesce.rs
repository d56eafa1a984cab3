// relay/coalesce.rs — Idempotent-call coalescer
//
// Keyed, TTL-bounded deduplication for the relay's *metadata* endpoints
// (quota status, sync init, bonus status). Concurrent callers with the same
// key share one in-flight future; later callers inside the TTL get the
// cached success. Failures never populate the cache — the next caller
// retries fresh. Translation calls must not go through this.

use crate::atoms::error::{CoreError, CoreResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, CoreError>>>;

enum Slot<T: Clone> {
    /// The generation distinguishes our call from a replacement started
    /// after our failure was processed.
    InFlight { generation: u64, call: SharedCall<T> },
    Cached { value: T, at: Instant },
}

pub struct CallCoalescer<T: Clone> {
    ttl: Duration,
    next_generation: std::sync::atomic::AtomicU64,
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone + Send + Sync + 'static> CallCoalescer<T> {
    pub fn new(ttl: Duration) -> Self {
        CallCoalescer {
            ttl,
            next_generation: std::sync::atomic::AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Run `make()` under the key, or join/reuse whatever is already there.
    pub async fn run<F>(&self, key: &str, make: F) -> CoreResult<T>
    where
        F: FnOnce() -> BoxFuture<'static, CoreResult<T>>,
    {
        let (our_generation, call) = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Cached { value, at }) if at.elapsed() < self.ttl => {
                    debug!("[relay] coalescer hit for `{}`", key);
                    return Ok(value.clone());
                }
                Some(Slot::InFlight { generation, call }) => {
                    debug!("[relay] joining in-flight `{}`", key);
                    (*generation, call.clone())
                }
                _ => {
                    let generation = self
                        .next_generation
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let call = make().shared();
                    slots.insert(
                        key.to_string(),
                        Slot::InFlight { generation, call: call.clone() },
                    );
                    (generation, call)
                }
            }
        };

        let result = call.await;

        let mut slots = self.slots.lock();
        // Only touch the slot if it still holds *our* call; a failed call
        // may already have been replaced by a newer attempt.
        let ours = matches!(
            slots.get(key),
            Some(Slot::InFlight { generation, .. }) if *generation == our_generation
        );
        if ours {
            match &result {
                Ok(value) => {
                    slots.insert(
                        key.to_string(),
                        Slot::Cached { value: value.clone(), at: Instant::now() },
                    );
                }
                Err(_) => {
                    slots.remove(key);
                }
            }
        }
        result
    }

    /// Drop any cached value for the key (e.g. after a mutation that makes
    /// it stale).
    pub fn invalidate(&self, key: &str) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Cached { .. })) {
            slots.remove(key);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_call(
        counter: &Arc<AtomicUsize>,
        value: u64,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, CoreResult<u64>> {
        let counter = Arc::clone(counter);
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_call() {
        let coalescer = Arc::new(CallCoalescer::new(Duration::from_secs(30)));
        let counter = Arc::new(AtomicUsize::new(0));

        let a = {
            let coalescer = Arc::clone(&coalescer);
            let call = counting_call(&counter, 7, Duration::from_millis(50));
            tokio::spawn(async move { coalescer.run("sync_init", call).await })
        };
        let b = {
            let coalescer = Arc::clone(&coalescer);
            let call = counting_call(&counter, 8, Duration::from_millis(50));
            tokio::spawn(async move { coalescer.run("sync_init", call).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        // Both callers resolved to the value of the single executed call.
        assert_eq!(a, b);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_within_ttl_reused() {
        let coalescer = CallCoalescer::new(Duration::from_secs(30));
        let counter = Arc::new(AtomicUsize::new(0));

        let first = coalescer
            .run("quota", counting_call(&counter, 1, Duration::ZERO))
            .await
            .unwrap();
        let second = coalescer
            .run("quota", counting_call(&counter, 2, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_ttl_refetches() {
        let coalescer = CallCoalescer::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));

        coalescer.run("quota", counting_call(&counter, 1, Duration::ZERO)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = coalescer
            .run("quota", counting_call(&counter, 2, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let coalescer = CallCoalescer::new(Duration::from_secs(30));

        let failed: CoreResult<u64> = coalescer
            .run("quota", || async { Err(CoreError::RateLimited) }.boxed())
            .await;
        assert!(failed.is_err());

        let counter = Arc::new(AtomicUsize::new(0));
        let recovered = coalescer
            .run("quota", counting_call(&counter, 5, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(recovered, 5);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let coalescer = CallCoalescer::new(Duration::from_secs(30));
        let counter = Arc::new(AtomicUsize::new(0));

        coalescer.run("bonus", counting_call(&counter, 1, Duration::ZERO)).await.unwrap();
        coalescer.invalidate("bonus");
        let second = coalescer
            .run("bonus", counting_call(&counter, 2, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
