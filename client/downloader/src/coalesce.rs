//! Request coalescing.
//!
//! At most one in-flight operation per key: the first caller's future is
//! stored as a shared handle, later callers clone and await it instead of
//! re-entering the download path. Whichever awaiter completes the shared
//! future removes the entry, so a cancelled leader does not strand its
//! followers — they keep driving the same future.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type SharedFuture<T> = Shared<BoxFuture<'static, T>>;

pub struct Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Arc<Mutex<HashMap<String, SharedFuture<T>>>>,
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `make()` under `key`, or join the operation already running
    /// under it. Returns the shared result and whether this caller was
    /// the leader that started the operation.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (shared, leader) = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(key) {
                (existing.clone(), false)
            } else {
                let map = Arc::clone(&self.inflight);
                let owned_key = key.to_owned();
                let fut = make();
                let shared = async move {
                    let out = fut.await;
                    map.lock().remove(&owned_key);
                    out
                }
                .boxed()
                .shared();
                inflight.insert(key.to_owned(), shared.clone());
                (shared, true)
            }
        };
        (shared.await, leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let coalescer = Arc::new(Coalescer::<Vec<u8>>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = Arc::clone(&coalescer);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("pkg", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        b"identical bytes".to_vec()
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (bytes, leader) = handle.await.unwrap();
            assert_eq!(bytes, b"identical bytes");
            if leader {
                leaders += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let coalescer = Coalescer::<u32>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let r1 = runs.clone();
        let (a, _) = coalescer
            .run("a", move || async move {
                r1.fetch_add(1, Ordering::SeqCst);
                1
            })
            .await;
        let r2 = runs.clone();
        let (b, _) = coalescer
            .run("b", move || async move {
                r2.fetch_add(1, Ordering::SeqCst);
                2
            })
            .await;

        assert_eq!((a, b), (1, 2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn key_is_reusable_after_completion() {
        let coalescer = Coalescer::<u32>::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for expected in 1..=3 {
            let runs = runs.clone();
            let (value, leader) = coalescer
                .run("k", move || async move {
                    runs.fetch_add(1, Ordering::SeqCst) as u32 + 1
                })
                .await;
            assert_eq!(value, expected);
            assert!(leader);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
