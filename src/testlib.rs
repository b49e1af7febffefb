//! Shared test fixtures.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::config::RuntimeConfig;
use crate::engine::{Interpreter, ModuleDef};
use crate::error::{ErrorReporter, PendingError};
use crate::natives::{self, LineSink};

lazy_static! {
    static ref SERIAL: Mutex<()> = Mutex::new(());
}

/// Serializes tests that touch the process-wide runtime slot.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// Keeps every reported error for inspection.
pub struct CollectingReporter {
    seen: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        CollectingReporter {
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, err: &PendingError) {
        self.seen.lock().push(err.to_string());
    }
}

/// Lines written by the natives of a recording module.
#[derive(Clone)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

/// The counting module, writing into a transcript instead of stdout.
pub fn recording_module(name: &str) -> (ModuleDef, Transcript) {
    let transcript = Transcript(Arc::new(Mutex::new(Vec::new())));
    let lines = transcript.0.clone();
    let sink: LineSink = Arc::new(move |line: String| lines.lock().push(line));
    (natives::counting_module(name, sink), transcript)
}

/// A standalone interpreter held by the calling thread, outside the global runtime slot.
pub fn interpreter() -> (Interpreter, Arc<CollectingReporter>) {
    let reporter = Arc::new(CollectingReporter::new());
    let interp = Interpreter::new(RuntimeConfig::default(), reporter.clone());
    (interp, reporter)
}
