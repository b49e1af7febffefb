//! Errors and the engine's pending-error slot.
//!
//! Engine operations fail the way embedded interpreters usually do: the operation produces no
//! object and leaves a pending error behind. `ErrorSurface` is that slot. Host-facing calls
//! drain it into an `EngineError`, so a caller sees either a value or exactly one error.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

/// The category of a pending engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Initialization,
    Import,
    Attribute,
    Construction,
    Invocation,
    LockProtocol,
    Timeout,
    Finalized,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ErrorKind::Initialization => "InitializationError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Construction => "ConstructionError",
            ErrorKind::Invocation => "InvocationError",
            ErrorKind::LockProtocol => "LockProtocolViolation",
            ErrorKind::Timeout => "LockTimeout",
            ErrorKind::Finalized => "FinalizedError",
        };
        f.write_str(name)
    }
}

/// Misuse of the lock or of reference ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum LockViolation {
    #[error("the calling thread does not hold the engine lock")]
    NotHolder,
    #[error("the calling thread already holds the engine lock")]
    NestedAcquire,
    #[error("thread-state token does not match the outstanding save")]
    MismatchedToken,
    #[error("a thread-state token is still outstanding")]
    TokenOutstanding,
    #[error("release of a reference that was stolen by a container")]
    ReleaseOfStolen,
    #[error("release of a reference that was already released")]
    DoubleRelease,
    #[error("release of a reference by a party that does not own it")]
    NotOwner,
    #[error("release of a reference unknown to the ledger")]
    UnknownClaim,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("error initializing the engine: {0}")]
    Initialization(String),
    #[error("error importing module: {0}")]
    Import(String),
    #[error("error getting attribute: {0}")]
    Attribute(String),
    #[error("error constructing object: {0}")]
    Construction(String),
    #[error("error invoking callable: {0}")]
    Invocation(String),
    #[error("lock protocol violation: {0}")]
    LockProtocol(#[from] LockViolation),
    #[error("timed out after {0:?} waiting for the engine lock")]
    LockTimeout(Duration),
    #[error("the engine has been finalized")]
    Finalized,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            EngineError::Initialization(_) => ErrorKind::Initialization,
            EngineError::Import(_) => ErrorKind::Import,
            EngineError::Attribute(_) => ErrorKind::Attribute,
            EngineError::Construction(_) => ErrorKind::Construction,
            EngineError::Invocation(_) => ErrorKind::Invocation,
            EngineError::LockProtocol(_) => ErrorKind::LockProtocol,
            EngineError::LockTimeout(_) => ErrorKind::Timeout,
            EngineError::Finalized => ErrorKind::Finalized,
        }
    }
}

/// An error raised inside the engine and not yet consumed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PendingError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        PendingError {
            kind: kind,
            message: message.into(),
        }
    }

    /// Converts this into the host-level error. Lock and timeout errors have no string form
    /// to rebuild from, so they surface as invocation failures carrying the description.
    pub fn into_error(self) -> EngineError {
        let PendingError { kind, message } = self;
        match kind {
            ErrorKind::Initialization => EngineError::Initialization(message),
            ErrorKind::Import => EngineError::Import(message),
            ErrorKind::Attribute => EngineError::Attribute(message),
            ErrorKind::Construction => EngineError::Construction(message),
            ErrorKind::Finalized => EngineError::Finalized,
            ErrorKind::Invocation | ErrorKind::LockProtocol | ErrorKind::Timeout => {
                EngineError::Invocation(message)
            }
        }
    }
}

impl<'a> From<&'a EngineError> for PendingError {
    fn from(e: &'a EngineError) -> Self {
        let message = match *e {
            EngineError::Initialization(ref m)
            | EngineError::Import(ref m)
            | EngineError::Attribute(ref m)
            | EngineError::Construction(ref m)
            | EngineError::Invocation(ref m) => m.clone(),
            ref other => other.to_string(),
        };
        PendingError::new(e.kind(), message)
    }
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Receives pending errors when they are printed.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &PendingError);
}

/// Reports to the tracing subscriber. Never keeps anything.
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, err: &PendingError) {
        tracing::error!(kind = %err.kind, "{}", err.message);
    }
}

/// The process-scoped pending error slot: either empty or holding one error.
///
/// A second raise while an error is pending replaces it; the first error was never observed,
/// and the engine only ever reports the most recent failure.
pub struct ErrorSurface {
    slot: Mutex<Option<PendingError>>,
}

impl ErrorSurface {
    pub fn new() -> Self {
        ErrorSurface {
            slot: Mutex::new(None),
        }
    }

    pub fn raise(&self, err: PendingError) {
        let mut slot = self.slot.lock();
        if let Some(ref old) = *slot {
            tracing::debug!(replaced = %old, "pending error overwritten");
        }
        *slot = Some(err);
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The description of the pending error, if any. Does not clear it.
    pub fn check(&self) -> Option<String> {
        self.slot.lock().as_ref().map(|e| e.to_string())
    }

    pub fn take(&self) -> Option<PendingError> {
        self.slot.lock().take()
    }

    /// Emits the pending error to `reporter` and clears it. Returns false if nothing was pending.
    pub fn print(&self, reporter: &dyn ErrorReporter) -> bool {
        // Take first so the reporter runs without the slot locked.
        match self.take() {
            Some(err) => {
                reporter.report(&err);
                true
            }
            None => false,
        }
    }

    /// Converts an empty result into the pending error, clearing it.
    ///
    /// An empty result with nothing pending is itself an engine bug and is reported as a
    /// construction failure.
    pub fn check_result<T>(&self, r: Option<T>) -> Result<T, EngineError> {
        match r {
            Some(t) => Ok(t),
            None => match self.take() {
                Some(err) => Err(err.into_error()),
                None => Err(EngineError::Construction(
                    "operation returned no object without setting an error".into())),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_does_not_clear() {
        let s = ErrorSurface::new();
        s.raise(PendingError::new(ErrorKind::Import, "No module named 'x'"));
        assert_eq!(s.check().unwrap(), "ImportError: No module named 'x'");
        assert!(s.is_pending());
    }

    #[test]
    fn check_result_drains_the_slot() {
        let s = ErrorSurface::new();
        s.raise(PendingError::new(ErrorKind::Attribute, "no attribute 'y'"));
        let r: Result<(), _> = s.check_result(None);
        assert_eq!(r, Err(EngineError::Attribute("no attribute 'y'".into())));
        assert!(!s.is_pending());
    }

    #[test]
    fn empty_result_without_pending_is_an_error() {
        let s = ErrorSurface::new();
        let r: Result<u8, _> = s.check_result(None);
        assert_eq!(r.unwrap_err().kind(), ErrorKind::Construction);
        assert_eq!(s.check_result(Some(3u8)), Ok(3));
    }

    #[test]
    fn violations_keep_their_kind() {
        let e = EngineError::from(LockViolation::DoubleRelease);
        assert_eq!(e.kind(), ErrorKind::LockProtocol);
        assert_eq!(PendingError::from(&e).kind, ErrorKind::LockProtocol);
    }
}
