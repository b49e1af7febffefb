use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct BarrierState {
    arrived: usize,
    releases: u64,
}

/// Counts worker arrivals and releases waiters once `expected` have arrived.
///
/// Unlike `std::sync::Barrier`, arrivals never block, and the coordinator waits without
/// arriving itself.
pub struct CompletionBarrier {
    expected: usize,
    state: Mutex<BarrierState>,
    done: Condvar,
}

impl CompletionBarrier {
    pub fn new(expected: usize) -> Self {
        CompletionBarrier {
            expected: expected,
            state: Mutex::new(BarrierState {
                arrived: 0,
                releases: 0,
            }),
            done: Condvar::new(),
        }
    }

    /// A guard that signals arrival when dropped, including during a panic.
    pub fn arrival(self: &Arc<Self>) -> Arrival {
        Arrival {
            barrier: self.clone(),
            signalled: false,
        }
    }

    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    /// Times the count reached `expected`. Exactly one for a correctly used barrier.
    pub fn releases(&self) -> u64 {
        self.state.lock().releases
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().arrived >= self.expected
    }

    pub fn wait(&self) {
        let mut st = self.state.lock();
        while st.arrived < self.expected {
            self.done.wait(&mut st);
        }
    }

    /// Returns false if `timeout` passed before everyone arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.arrived < self.expected {
            if self.done.wait_until(&mut st, deadline).timed_out() {
                return st.arrived >= self.expected;
            }
        }
        true
    }

    fn signal(&self) {
        let mut st = self.state.lock();
        st.arrived += 1;
        if st.arrived == self.expected {
            st.releases += 1;
            drop(st);
            tracing::debug!(expected = self.expected, "completion barrier released");
            self.done.notify_all();
        } else if st.arrived > self.expected {
            tracing::warn!(arrived = st.arrived, expected = self.expected, "arrival past barrier count");
        }
    }
}

pub struct Arrival {
    barrier: Arc<CompletionBarrier>,
    signalled: bool,
}

impl Arrival {
    /// Signals now rather than at drop.
    pub fn arrive(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if !self.signalled {
            self.signalled = true;
            self.barrier.signal();
        }
    }
}

impl Drop for Arrival {
    fn drop(&mut self) {
        self.signal();
    }
}
