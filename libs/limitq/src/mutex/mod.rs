//! Priority-ordered mutual exclusion.
//!
//! `PriorityMutex` serializes a critical section (or, with capacity above 1,
//! bounds the number of concurrent holders). Waiters are admitted by priority,
//! and in arrival order within the same priority. A released slot is handed
//! directly to the most urgent waiter, so a caller arriving later can never
//! overtake a waiter which was already queued.
//!
//! The mutex is not re-entrant: acquiring it again from inside the critical
//! section, while all slots are held, waits forever.
use crate::{config::Concurrency, ctx, metrics, time};
use std::{cmp::Reverse, collections::BTreeMap, fmt, future::Future, sync::Mutex};
use tokio::sync::oneshot;


/// Priority of a waiter. Numerically larger values are more urgent.
pub type Priority = i64;

/// Position of a waiter in the queue: higher priority first, then arrival order.
type Key = (Reverse<Priority>, u64);

struct State {
    /// Number of slots currently held.
    running: usize,
    /// Waiters which didn't get a slot yet.
    /// Invariant: non-empty only if `running == capacity`.
    waiters: BTreeMap<Key, oneshot::Sender<()>>,
    /// Arrival sequence number of the next waiter.
    next_seq: u64,
}

/// Mutex admitting waiters by priority.
pub struct PriorityMutex {
    capacity: Concurrency,
    state: Mutex<State>,
}

impl Default for PriorityMutex {
    fn default() -> Self {
        Self::new(Concurrency::ONE)
    }
}

impl fmt::Debug for PriorityMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityMutex")
            .field("capacity", &self.capacity)
            .field("running", &self.running())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Ownership of a slot of a `PriorityMutex`.
/// Dropping it passes the slot to the most urgent waiter.
#[must_use]
pub struct Permit<'a>(&'a PriorityMutex);

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Queued `lock()` call. Dropping it before the grant is observed
/// removes it from the queue, or passes on the slot it has been granted meanwhile.
struct Waiter<'a> {
    mutex: &'a PriorityMutex,
    key: Key,
    recv: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let removed = self.mutex.state.lock().unwrap().waiters.remove(&self.key);
        if removed.is_some() {
            let Reverse(priority) = self.key.0;
            tracing::trace!(priority, "waiter canceled");
            metrics::MUTEX.canceled_waiters.inc();
        } else {
            // The slot was handed over to us, but nobody is going to use it.
            self.mutex.release();
        }
    }
}

impl PriorityMutex {
    /// Constructs a mutex with `capacity` slots.
    pub fn new(capacity: Concurrency) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                running: 0,
                waiters: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> Concurrency {
        self.capacity
    }

    /// Whether all slots are held.
    pub fn locked(&self) -> bool {
        self.running() >= self.capacity.get()
    }

    /// Number of slots currently held.
    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }

    /// Number of callers waiting for a slot.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(((Reverse(priority), _), send)) = state.waiters.pop_first() {
            // Receiver is alive as long as its entry is in `waiters`.
            let _ = send.send(());
            tracing::trace!(priority, "handing slot over");
            return;
        }
        state.running -= 1;
    }

    /// Waits until a slot is available and takes it.
    /// Among the waiting callers, the one with the highest `priority` gets the slot first;
    /// callers with equal priority get it in the order of calls.
    /// If `ctx` gets canceled first, the caller leaves the queue without taking a slot.
    pub async fn lock<'a>(
        &'a self,
        ctx: &ctx::Ctx,
        priority: Priority,
    ) -> ctx::OrCanceled<Permit<'a>> {
        let start = time::Instant::now();
        let mut waiter = {
            let mut state = self.state.lock().unwrap();
            if state.running < self.capacity.get() {
                state.running += 1;
                return Ok(Permit(self));
            }
            let key = (Reverse(priority), state.next_seq);
            state.next_seq += 1;
            let (send, recv) = oneshot::channel();
            state.waiters.insert(key, send);
            Waiter {
                mutex: self,
                key,
                recv,
                granted: false,
            }
        };
        // On cancelation `waiter` is dropped, which cleans up.
        match ctx.wait(&mut waiter.recv).await? {
            Ok(()) => {}
            // Senders are dropped without sending only when removed by the waiter itself.
            Err(_) => unreachable!("waiter removed from the queue"),
        }
        waiter.granted = true;
        metrics::MUTEX.wait_latency.observe(start.elapsed());
        Ok(Permit(self))
    }

    /// Executes `f` holding a slot, and returns its output unchanged.
    /// The slot is released once `f` completes (or panics), so a failure
    /// of `f` only affects this caller.
    /// `f` is not started at all if `ctx` gets canceled before a slot is granted.
    pub async fn exec<T, F: Future<Output = T>>(
        &self,
        ctx: &ctx::Ctx,
        priority: Priority,
        f: impl FnOnce() -> F,
    ) -> ctx::OrCanceled<T> {
        let _permit = self.lock(ctx, priority).await?;
        Ok(f().await)
    }
}
