//! Fair semaphore with a process-wide registry.
//!
//! The message-attachment driver rate-limits uploads across every instance
//! pointing at the same backend, so the semaphore lives in a process-wide
//! registry keyed by driver-config id. Waiters are served strictly FIFO, and
//! a reconstruction that registers a new capacity updates the shared
//! semaphore in place — an expansion drains waiters immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::cancel::CancelToken;
use stowage_types::Result;

struct SemState {
    in_use: u32,
    max: u32,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// A FIFO-fair counting semaphore.
pub struct FairSemaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl FairSemaphore {
    pub fn new(max: u32) -> Self {
        Self {
            state: Mutex::new(SemState {
                in_use: 0,
                max: max.max(1),
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquire a slot, waiting in FIFO order.
    ///
    /// A cancel observed while waiting removes this waiter from the queue
    /// before returning `ABORTED`, so no slot is leaked and the next waiter
    /// is not starved.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<SemaphoreGuard<'_>> {
        let mut state = self.state.lock().expect("semaphore poisoned");
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            let front = state.queue.front().copied();
            if front == Some(ticket) && state.in_use < state.max {
                state.queue.pop_front();
                state.in_use += 1;
                self.cond.notify_all();
                return Ok(SemaphoreGuard { sem: self });
            }

            let (next, timeout) = self
                .cond
                .wait_timeout(state, Duration::from_millis(50))
                .expect("semaphore poisoned");
            state = next;
            if timeout.timed_out() && cancel.is_cancelled() {
                state.queue.retain(|t| *t != ticket);
                self.cond.notify_all();
                drop(state);
                return Err(stowage_types::StorageError::aborted());
            }
        }
    }

    /// Update capacity; an increase drains waiters immediately.
    pub fn set_max(&self, max: u32) {
        let mut state = self.state.lock().expect("semaphore poisoned");
        state.max = max.max(1);
        self.cond.notify_all();
    }

    /// Slots currently held.
    pub fn in_use(&self) -> u32 {
        self.state.lock().expect("semaphore poisoned").in_use
    }

    pub fn max(&self) -> u32 {
        self.state.lock().expect("semaphore poisoned").max
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("semaphore poisoned");
        state.in_use = state.in_use.saturating_sub(1);
        self.cond.notify_all();
    }
}

/// RAII slot holder.
pub struct SemaphoreGuard<'a> {
    sem: &'a FairSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// Fetch the process-wide semaphore for a config key, updating its capacity.
pub fn shared_semaphore(key: &str, max: u32) -> Arc<FairSemaphore> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<FairSemaphore>>>> = OnceLock::new();

    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("semaphore registry poisoned");
    match map.get(key) {
        Some(sem) => {
            sem.set_max(max);
            Arc::clone(sem)
        }
        None => {
            let sem = Arc::new(FairSemaphore::new(max));
            map.insert(key.to_string(), Arc::clone(&sem));
            sem
        }
    }
}
