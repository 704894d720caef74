//! The snapshot-program cache.
//!
//! The only component that performs network I/O on the snapshot critical
//! path, and it does so strictly before the world stops. Concurrent
//! requests for one key share a single in-flight fetch; on a cancelled
//! fetch the next waiter retries instead of inheriting the cancellation.
//!
//! Capacity is deliberately tiny (two programs by default — one per binary
//! version during a deploy); eviction picks an arbitrary resident entry.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use gazer_program::SnapshotProgram;

use crate::fetcher::{FetchError, ProgramFetcher};

/// Default number of resident programs.
pub const DEFAULT_CACHE_CAPACITY: usize = 2;

/// One in-flight fetch; waiters park on the condvar until the leader
/// publishes a result.
struct Flight {
    done: Mutex<Option<Result<Arc<SnapshotProgram>, FetchError>>>,
    cv: Condvar,
}

impl Flight {
    fn new() -> Self {
        Flight {
            done: Mutex::new(None),
            cv: Condvar::new(),
        }
    }
}

struct CacheState {
    cache: FxHashMap<String, Arc<SnapshotProgram>>,
    inflight: FxHashMap<String, Arc<Flight>>,
}

/// Caching wrapper around a [`ProgramFetcher`].
pub struct ProgramCache {
    fetcher: Arc<dyn ProgramFetcher>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl ProgramCache {
    /// Cache with the default capacity.
    pub fn new(fetcher: Arc<dyn ProgramFetcher>) -> Self {
        Self::with_capacity(fetcher, DEFAULT_CACHE_CAPACITY)
    }

    /// Cache holding at most `capacity` programs.
    pub fn with_capacity(fetcher: Arc<dyn ProgramFetcher>, capacity: usize) -> Self {
        ProgramCache {
            fetcher,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                cache: FxHashMap::default(),
                inflight: FxHashMap::default(),
            }),
        }
    }

    /// Return the cached program for `key`, fetching it on a miss.
    ///
    /// At most one fetch is in flight per key; concurrent callers wait on
    /// the same result. A waiter observing a cancelled fetch retries the
    /// whole lookup (becoming the new leader if nobody else has); any
    /// other error propagates to every waiter.
    pub fn get_or_fetch(&self, key: &str) -> Result<Arc<SnapshotProgram>, FetchError> {
        loop {
            let (flight, leader) = {
                let mut st = self.state.lock();
                if let Some(p) = st.cache.get(key) {
                    return Ok(p.clone());
                }
                match st.inflight.get(key) {
                    Some(f) => (f.clone(), false),
                    None => {
                        let f = Arc::new(Flight::new());
                        st.inflight.insert(key.to_string(), f.clone());
                        (f, true)
                    }
                }
            };

            if leader {
                let result = self.fetcher.fetch(key).map(Arc::new);
                {
                    let mut st = self.state.lock();
                    if let Ok(p) = &result {
                        while st.cache.len() >= self.capacity && !st.cache.is_empty() {
                            // Arbitrary victim; map iteration order serves
                            // as the randomization.
                            let victim = st
                                .cache
                                .keys()
                                .next()
                                .expect("cache is non-empty")
                                .clone();
                            st.cache.remove(&victim);
                        }
                        st.cache.insert(key.to_string(), p.clone());
                    }
                    st.inflight.remove(key);
                }
                match &result {
                    Ok(_) => tracing::debug!(key, "snapshot program fetched"),
                    Err(e) => tracing::warn!(key, error = %e, "snapshot program fetch failed"),
                }
                *flight.done.lock() = Some(result.clone());
                flight.cv.notify_all();
                return result;
            }

            let result = {
                let mut done = flight.done.lock();
                while done.is_none() {
                    flight.cv.wait(&mut done);
                }
                done.clone().expect("flight concluded")
            };
            match result {
                Err(e) if e.is_cancelled() => continue,
                other => return other,
            }
        }
    }

    /// Number of resident programs.
    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl CountingFetcher {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(CountingFetcher {
                calls: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    impl ProgramFetcher for CountingFetcher {
        fn fetch(&self, key: &str) -> Result<SnapshotProgram, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::Cancelled);
            }
            Ok(SnapshotProgram {
                bytecode: key.as_bytes().to_vec(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_hit_after_miss() {
        let fetcher = CountingFetcher::new(0);
        let cache = ProgramCache::new(fetcher.clone());
        let a = cache.get_or_fetch("k1").unwrap();
        let b = cache.get_or_fetch("k1").unwrap();
        assert_eq!(a.bytecode, b.bytecode);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let fetcher = CountingFetcher::new(0);
        let cache = ProgramCache::with_capacity(fetcher, 2);
        cache.get_or_fetch("k1").unwrap();
        cache.get_or_fetch("k2").unwrap();
        cache.get_or_fetch("k3").unwrap();
        assert_eq!(cache.len(), 2, "insert at capacity evicts one entry");
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_cancelled_fetch_is_retried_by_next_caller() {
        let fetcher = CountingFetcher::new(1);
        let cache = ProgramCache::new(fetcher.clone());
        // The first (leader) caller sees the cancellation.
        assert!(cache.get_or_fetch("k").unwrap_err().is_cancelled());
        // The next caller retries and succeeds.
        assert_eq!(cache.get_or_fetch("k").unwrap().bytecode, b"k".to_vec());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        struct FailingFetcher;
        impl ProgramFetcher for FailingFetcher {
            fn fetch(&self, _key: &str) -> Result<SnapshotProgram, FetchError> {
                Err(FetchError::Remote("boom".into()))
            }
        }
        let cache = ProgramCache::new(Arc::new(FailingFetcher));
        let err = cache.get_or_fetch("k").unwrap_err();
        assert!(matches!(err, FetchError::Remote(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_callers_share_one_fetch() {
        struct SlowFetcher {
            calls: AtomicUsize,
        }
        impl ProgramFetcher for SlowFetcher {
            fn fetch(&self, _key: &str) -> Result<SnapshotProgram, FetchError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(SnapshotProgram::default())
            }
        }

        let fetcher = Arc::new(SlowFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ProgramCache::new(fetcher.clone()));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                cache.get_or_fetch("k").unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
