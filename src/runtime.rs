//! Process-wide lifecycle of the engine.
//!
//! At most one engine is live at a time. `Runtime` is the coordinator's handle: it is created
//! holding the lock, lends out `Held` while it keeps holding, and tears the engine down exactly
//! once, either through `finalize` or when it drops.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::engine::{Core, Held, Interpreter, LedgerStats};
use crate::error::{EngineError, ErrorReporter, LockViolation, LoggingErrorReporter};
use crate::lock::{RestoreError, ThreadState};

lazy_static! {
    static ref CURRENT: Mutex<Option<Weak<Core>>> = Mutex::new(None);
}

fn live_core() -> Option<Arc<Core>> {
    CURRENT.lock().as_ref()
        .and_then(Weak::upgrade)
        .filter(|core| !core.is_finalized())
}

/// Whether an engine is initialized and not yet finalized.
pub fn is_initialized() -> bool {
    live_core().is_some()
}

/// A handle on the live engine, for code that was not handed one.
pub fn current_interpreter() -> Result<Interpreter, EngineError> {
    live_core()
        .map(Interpreter::from_core)
        .ok_or_else(|| EngineError::Initialization("the engine is not initialized".into()))
}

/// The coordinator's handle on the engine. Pinned to the thread that initialized it.
pub struct Runtime {
    interp: Interpreter,
    holding: bool,
    finalized: bool,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Brings the engine up with errors reported through `tracing`.
    pub fn initialize(config: RuntimeConfig) -> Result<Runtime, EngineError> {
        Self::initialize_with(config, Arc::new(LoggingErrorReporter))
    }

    /// Brings the engine up. The calling thread holds the lock when this returns.
    pub fn initialize_with(config: RuntimeConfig, reporter: Arc<dyn ErrorReporter>) -> Result<Runtime, EngineError> {
        let mut current = CURRENT.lock();
        if current.as_ref().and_then(Weak::upgrade).map_or(false, |core| !core.is_finalized()) {
            return Err(EngineError::Initialization("the engine is already initialized".into()));
        }
        let interp = Interpreter::new(config, reporter);
        *current = Some(Arc::downgrade(interp.core()));
        drop(current);

        if !is_initialized() {
            return Err(EngineError::Initialization("the engine did not come up".into()));
        }
        tracing::info!(config = ?interp.config(), "engine initialized");

        Ok(Runtime {
            interp: interp,
            holding: true,
            finalized: false,
            _not_send: PhantomData,
        })
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interp
    }

    pub fn is_holding(&self) -> bool {
        self.holding
    }

    /// Proof of holding, for building objects on the coordinator thread.
    pub fn held(&self) -> Result<Held<'_>, EngineError> {
        if !self.holding {
            return Err(LockViolation::NotHolder.into());
        }
        Ok(Held::new(self.interp.core()))
    }

    /// Gives up the lock so workers can run. Hand the token back to `restore_and_acquire`.
    pub fn save_and_release(&mut self) -> Result<ThreadState, EngineError> {
        if !self.holding {
            return Err(LockViolation::NotHolder.into());
        }
        let core = self.interp.core();
        let ctx = core.leave();
        match core.lock.save_and_release(ctx) {
            Ok(token) => {
                self.holding = false;
                Ok(token)
            }
            Err(v) => {
                core.enter(ctx);
                Err(v.into())
            }
        }
    }

    /// Blocks until every other holder has let go, then takes the lock back. A refused restore
    /// returns the token inside the error.
    pub fn restore_and_acquire(&mut self, token: ThreadState) -> Result<(), RestoreError> {
        let core = self.interp.core();
        let ctx = core.lock.restore_and_acquire(token)?;
        core.enter(ctx);
        self.holding = true;
        Ok(())
    }

    /// Runs `f` with the lock released. The lock is taken back before returning, even if `f`
    /// panics.
    pub fn allow_threads<F, R>(&mut self, f: F) -> Result<R, EngineError> where
    F: FnOnce() -> R,
    {
        let token = self.save_and_release()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(f));
        if let Err(e) = self.restore_and_acquire(token) {
            if let Err(payload) = outcome {
                tracing::error!(error = %e, "lock not restored after a panic");
                panic::resume_unwind(payload);
            }
            return Err(e.into());
        }
        match outcome {
            Ok(r) => Ok(r),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Tears the engine down and returns the final reference counts.
    pub fn finalize(mut self) -> Result<LedgerStats, EngineError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<LedgerStats, EngineError> {
        if self.finalized {
            return Err(EngineError::Finalized);
        }
        self.finalized = true;

        let core = self.interp.core();
        let result = core.shutdown();
        self.holding = false;

        let mut current = CURRENT.lock();
        if current.as_ref().map_or(false, |w| w.as_ptr() == Arc::as_ptr(core)) {
            *current = None;
        }
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if let Err(e) = self.teardown() {
            tracing::error!(error = %e, "engine teardown failed");
        }
    }
}
