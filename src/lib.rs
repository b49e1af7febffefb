//! Drives a single-threaded, globally-locked execution engine from many host threads.
//!
//! The pieces, leaves first:
//!
//! * `engine`: the object heap, its reference ledger and the operations on it. Every operation
//!   needs a `Held`, the proof that the calling thread holds the lock.
//! * `lock`: the global lock, with save/restore for the coordinator and acquire/release for
//!   workers.
//! * `runtime`: initialize-once, finalize-once lifecycle of the process-wide engine.
//! * `dispatch`: runs invocations on worker threads and waits for them with a completion barrier.
//! * `error`: the pending-error slot and the host-level error type.

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lock;
pub mod natives;
pub mod runtime;

#[cfg(test)]
pub mod testlib;

pub use crate::config::{ConfigError, RuntimeConfig};
pub use crate::dispatch::{dispatch, dispatch_all, CallFrame, CompletionBarrier, Invocable, Invocation};
pub use crate::engine::{AsObject, BorrowedRef, GilGuard, Held, Interpreter, LedgerStats, ModuleDef, Ref};
pub use crate::error::{EngineError, ErrorKind, ErrorReporter, LockViolation, LoggingErrorReporter};
pub use crate::runtime::{is_initialized, Runtime};
