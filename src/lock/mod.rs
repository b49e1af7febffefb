//! The global exclusivity lock.
//!
//! Exactly one thread may touch engine state at a time. The lock starts out held by the thread
//! that created it (the coordinator). The coordinator gives it up with `save_and_release`, which
//! hands back a `ThreadState` token, and takes it back with `restore_and_acquire`. Threads with no
//! saved state (freshly spawned workers) use `acquire`/`release`.
//!
//! The lock is not reentrant. A holder that tries to acquire again gets `NestedAcquire` instead
//! of deadlocking itself.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::error::{EngineError, LockViolation};


/// The engine-side execution context of a thread, captured into a token on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub id: u64,
    /// Registered for the thread's lifetime, as opposed to created for one acquisition.
    pub bound: bool,
}

struct Saved {
    id: u64,
    owner: ThreadId,
}

struct LockState {
    holder: Option<ThreadId>,
    saved: Option<Saved>,
    next_token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    pub acquisitions: u64,
    /// Acquisitions that had to wait for another holder.
    pub contended: u64,
    pub wait_ns: u64,
    pub saves: u64,
    pub restores: u64,
}

#[derive(Default)]
struct Counters {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    wait_ns: AtomicU64,
    saves: AtomicU64,
    restores: AtomicU64,
}

/// A suspended lock holder. Produced by `save_and_release`, consumed by exactly one
/// `restore_and_acquire` on the same thread. Neither `Clone` nor `Send`.
pub struct ThreadState {
    id: u64,
    owner: ThreadId,
    context: Option<ThreadContext>,
    armed: bool,
    _not_send: PhantomData<*const ()>,
}

impl ThreadState {
    pub fn context(&self) -> Option<ThreadContext> {
        self.context
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("context", &self.context)
            .finish()
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(token = self.id, "thread-state token dropped without restore");
        }
    }
}

/// A refused restore. The token comes back untouched and can be restored once the cause is gone.
#[derive(Debug, Error)]
#[error("{violation}")]
pub struct RestoreError {
    pub violation: LockViolation,
    pub token: ThreadState,
}

impl From<RestoreError> for EngineError {
    fn from(e: RestoreError) -> Self {
        e.violation.into()
    }
}

pub struct GlobalLock {
    state: Mutex<LockState>,
    freed: Condvar,
    counters: Counters,
}

impl GlobalLock {
    /// Creates the lock, held by the calling thread.
    pub fn new_held() -> Self {
        GlobalLock {
            state: Mutex::new(LockState {
                holder: Some(thread::current().id()),
                saved: None,
                next_token: 1,
            }),
            freed: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }

    pub fn is_free(&self) -> bool {
        self.state.lock().holder.is_none()
    }

    pub fn has_saved_token(&self) -> bool {
        self.state.lock().saved.is_some()
    }

    /// Records the caller's context into a token and frees the lock for any thread.
    pub fn save_and_release(&self, context: Option<ThreadContext>) -> Result<ThreadState, LockViolation> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.holder != Some(me) {
            return Err(LockViolation::NotHolder);
        }
        if st.saved.is_some() {
            return Err(LockViolation::TokenOutstanding);
        }

        let id = st.next_token;
        st.next_token += 1;
        st.saved = Some(Saved {
            id: id,
            owner: me,
        });
        st.holder = None;
        drop(st);
        self.freed.notify_one();

        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(token = id, "saved thread state and released engine lock");

        Ok(ThreadState {
            id: id,
            owner: me,
            context: context,
            armed: true,
            _not_send: PhantomData,
        })
    }

    /// Blocks until the lock is free, then gives it back to the token's owner.
    /// Returns the context captured at save time.
    pub fn restore_and_acquire(&self, mut token: ThreadState) -> Result<Option<ThreadContext>, RestoreError> {
        let me = thread::current().id();
        let mut st = self.state.lock();

        let matches = match st.saved {
            Some(ref saved) => saved.id == token.id && saved.owner == token.owner,
            None => false,
        };
        let refused = if !matches || token.owner != me {
            Some(LockViolation::MismatchedToken)
        } else if st.holder == Some(me) {
            Some(LockViolation::NestedAcquire)
        } else {
            None
        };
        if let Some(violation) = refused {
            drop(st);
            tracing::debug!(token = token.id, %violation, "refused restore");
            return Err(RestoreError {
                violation: violation,
                token: token,
            });
        }

        self.wait_free(&mut st, None);
        st.holder = Some(me);
        st.saved = None;
        drop(st);
        token.armed = false;
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);

        self.counters.restores.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(token = token.id, "restored thread state");
        Ok(token.context)
    }

    /// Acquires for a thread with no saved state. `timeout` of None waits forever.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.holder == Some(me) {
            return Err(LockViolation::NestedAcquire.into());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        if !self.wait_free(&mut st, deadline) {
            // timeout is Some whenever wait_free gives up
            return Err(EngineError::LockTimeout(timeout.unwrap_or_default()));
        }
        st.holder = Some(me);
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn release(&self) -> Result<(), LockViolation> {
        let mut st = self.state.lock();
        if st.holder != Some(thread::current().id()) {
            return Err(LockViolation::NotHolder);
        }
        st.holder = None;
        drop(st);
        self.freed.notify_one();
        Ok(())
    }

    /// Leaves the lock unheld for good. Only the holder may tear down, and only once its
    /// token (if any) has come home.
    pub fn teardown(&self) -> Result<(), LockViolation> {
        let mut st = self.state.lock();
        if st.saved.is_some() {
            return Err(LockViolation::TokenOutstanding);
        }
        if st.holder != Some(thread::current().id()) {
            return Err(LockViolation::NotHolder);
        }
        st.holder = None;
        drop(st);
        // Stragglers blocked in acquire wake up, see the engine is gone and back out.
        self.freed.notify_all();
        Ok(())
    }

    pub fn stats(&self) -> LockStats {
        let c = &self.counters;
        LockStats {
            acquisitions: c.acquisitions.load(Ordering::Relaxed),
            contended: c.contended.load(Ordering::Relaxed),
            wait_ns: c.wait_ns.load(Ordering::Relaxed),
            saves: c.saves.load(Ordering::Relaxed),
            restores: c.restores.load(Ordering::Relaxed),
        }
    }

    /// Waits until nobody holds the lock. Returns false if the deadline passed first.
    fn wait_free(&self, st: &mut MutexGuard<LockState>, deadline: Option<Instant>) -> bool {
        if st.holder.is_none() {
            return true;
        }

        self.counters.contended.fetch_add(1, Ordering::Relaxed);
        let start = time::precise_time_ns();
        let mut acquired = true;
        while st.holder.is_some() {
            match deadline {
                Some(d) => {
                    if self.freed.wait_until(st, d).timed_out() && st.holder.is_some() {
                        acquired = false;
                        break;
                    }
                }
                None => self.freed.wait(st),
            }
        }
        let waited = time::precise_time_ns().saturating_sub(start);
        self.counters.wait_ns.fetch_add(waited, Ordering::Relaxed);
        tracing::trace!(waited_ns = waited, acquired = acquired, "waited for engine lock");

        acquired
    }
}
