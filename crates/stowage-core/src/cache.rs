//! Short-TTL metadata caches.
//!
//! Drivers cache remote metadata for seconds, not minutes: long enough to
//! absorb burst traffic, short enough that the backend stays the source of
//! truth. Three shapes cover every use:
//!
//! - [`TtlCell`] — one value, single in-flight producer (concurrent misses
//!   deduplicate onto one fetch)
//! - [`TtlMap`] — keyed values with last-writer-wins semantics
//! - [`FifoMap`] — bounded insertion-order eviction, no expiry

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use stowage_types::Result;

enum CellState<T> {
    Empty,
    InFlight,
    Ready { value: T, expires: Instant },
}

/// A single cached value with single-flight population.
///
/// Concurrent callers that miss wait for the one in-flight fetch instead of
/// stampeding the backend. A failed fetch empties the cell so the next caller
/// retries.
pub struct TtlCell<T> {
    state: Mutex<CellState<T>>,
    cond: Condvar,
}

impl<T: Clone> TtlCell<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState::Empty),
            cond: Condvar::new(),
        }
    }

    /// Get the cached value, or run `fetch` as the single producer.
    pub fn get_or_fetch<F>(&self, ttl: Duration, cancel: &CancelToken, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.state.lock().expect("ttl cell poisoned");
        loop {
            let in_flight = match &*state {
                CellState::Ready { value, expires } if *expires > Instant::now() => {
                    return Ok(value.clone());
                }
                CellState::InFlight => true,
                _ => false,
            };
            if !in_flight {
                break;
            }
            let (next, timeout) = self
                .cond
                .wait_timeout(state, Duration::from_millis(50))
                .expect("ttl cell poisoned");
            state = next;
            if timeout.timed_out() {
                cancel.checkpoint()?;
            }
        }
        *state = CellState::InFlight;
        drop(state);

        let outcome = fetch();

        let mut state = self.state.lock().expect("ttl cell poisoned");
        match &outcome {
            Ok(value) => {
                *state = CellState::Ready {
                    value: value.clone(),
                    expires: Instant::now() + ttl,
                };
            }
            Err(_) => *state = CellState::Empty,
        }
        self.cond.notify_all();
        drop(state);
        outcome
    }

    /// Drop any cached value.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().expect("ttl cell poisoned");
        if !matches!(*state, CellState::InFlight) {
            *state = CellState::Empty;
        }
    }

    /// Peek without fetching.
    pub fn peek(&self) -> Option<T> {
        let state = self.state.lock().expect("ttl cell poisoned");
        match &*state {
            CellState::Ready { value, expires } if *expires > Instant::now() => {
                Some(value.clone())
            }
            _ => None,
        }
    }
}

impl<T: Clone> Default for TtlCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed cache with per-entry expiry, last-writer-wins.
pub struct TtlMap<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().expect("ttl map poisoned");
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().expect("ttl map poisoned");
        let now = Instant::now();
        // Opportunistic sweep keeps the map from accumulating dead entries.
        if entries.len() > 256 {
            entries.retain(|_, (_, expires)| *expires > now);
        }
        entries.insert(key, (value, now + self.ttl));
    }

    pub fn remove(&self, key: &K) {
        self.entries.lock().expect("ttl map poisoned").remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("ttl map poisoned").clear();
    }
}

/// Bounded map with insertion-order (FIFO) eviction.
pub struct FifoMap<K, V> {
    capacity: usize,
    inner: Mutex<FifoInner<K, V>>,
}

struct FifoInner<K, V> {
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> FifoMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(FifoInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock().expect("fifo map poisoned");
        inner.entries.get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("fifo map poisoned");
        if inner.entries.insert(key.clone(), value).is_none() {
            inner.order.push_back(key);
            while inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                }
            }
        }
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().expect("fifo map poisoned");
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("fifo map poisoned");
        inner.order.clear();
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("fifo map poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
