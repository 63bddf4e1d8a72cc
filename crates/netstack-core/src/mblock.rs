//! Fixed-size object pool, modeled after the original `mblock`: a bounded
//! set of slots handed out and returned under a counting-semaphore
//! discipline so `alloc` can block when the pool is exhausted.
//!
//! The original carves a caller-supplied array into intrusive-list slots.
//! Rust's allocator makes that unnecessary — slots here are plain boxed
//! values — but the blocking-admission contract (the actual behavior
//! callers depend on) is preserved exactly: a pool of `N` permits, taken on
//! `alloc` and returned on `free`, with the same three timeout disciplines.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{NetError, NetResult};

/// Mirrors the original's three allocation disciplines for `tmo_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until a slot is available.
    Forever,
    /// Block for at most this many milliseconds.
    Millis(u64),
    /// Return immediately with `mem` if none is free.
    NonBlocking,
}

impl Timeout {
    pub fn from_ms(tmo_ms: i64) -> Timeout {
        if tmo_ms < 0 {
            Timeout::NonBlocking
        } else if tmo_ms == 0 {
            Timeout::Forever
        } else {
            Timeout::Millis(tmo_ms as u64)
        }
    }
}

struct Inner<T> {
    free: VecDeque<T>,
}

/// A bounded pool of `T`, admission-controlled by a counting semaphore
/// equivalent (`Condvar` + remaining-count check).
pub struct MBlock<T> {
    capacity: usize,
    state: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> MBlock<T> {
    pub fn new(initial: impl IntoIterator<Item = T>) -> MBlock<T> {
        let free: VecDeque<T> = initial.into_iter().collect();
        MBlock {
            capacity: free.len(),
            state: Mutex::new(Inner { free }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn alloc(&self, tmo: Timeout) -> NetResult<T> {
        let mut guard = self.state.lock().unwrap();
        match tmo {
            Timeout::NonBlocking => guard.free.pop_front().ok_or(NetError::Mem),
            Timeout::Forever => {
                while guard.free.is_empty() {
                    guard = self.available.wait(guard).unwrap();
                }
                Ok(guard.free.pop_front().unwrap())
            }
            Timeout::Millis(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms);
                while guard.free.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(NetError::Tmo);
                    }
                    let (g, result) = self
                        .available
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    guard = g;
                    if result.timed_out() && guard.free.is_empty() {
                        return Err(NetError::Tmo);
                    }
                }
                Ok(guard.free.pop_front().unwrap())
            }
        }
    }

    pub fn free(&self, item: T) {
        let mut guard = self.state.lock().unwrap();
        guard.free.push_front(item);
        drop(guard);
        self.available.notify_one();
    }
}
