//! Running invocations on worker threads.
//!
//! Each worker binds its engine context (if configured), acquires the lock, invokes its target
//! with a shared call frame, releases the lock and signals a completion barrier. The
//! coordinator must have given up the lock (`Runtime::save_and_release`) before workers can
//! make progress, and waits on the barrier before taking it back.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use futures::future;
use futures::sync::oneshot;
use futures::{Async, Future, Poll};

use crate::engine::{AsObject, Held, Interpreter, ObjectId, Ref};
use crate::error::EngineError;
use crate::runtime::Runtime;

mod barrier;

#[cfg(test)]
mod test;

pub use self::barrier::{Arrival, CompletionBarrier};

static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);

/// An engine object known to be callable.
pub struct Invocable {
    callable: Ref,
}

impl Invocable {
    pub fn new(held: Held<'_>, callable: Ref) -> Result<Invocable, EngineError> {
        if !held.is_callable(&callable) {
            let type_name = held.type_name(&callable).unwrap_or("released");
            return Err(EngineError::Invocation(format!("'{}' object is not callable", type_name)));
        }
        Ok(Invocable {
            callable: callable,
        })
    }

    pub fn callable(&self) -> &Ref {
        &self.callable
    }

    pub fn invoke(&self, held: Held<'_>, frame: &CallFrame) -> Result<Ref, EngineError> {
        frame.invoke(held, &self.callable)
    }
}

impl AsObject for Invocable {
    fn object_id(&self) -> ObjectId {
        self.callable.object_id()
    }
}

impl fmt::Debug for Invocable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invocable({:?})", self.callable)
    }
}

/// Positional arguments plus an optional keyword mapping. Read-only once built, so one frame
/// can be shared by any number of workers.
#[derive(Debug)]
pub struct CallFrame {
    args: Ref,
    kwargs: Option<Ref>,
}

impl CallFrame {
    pub fn new(held: Held<'_>, args: Ref, kwargs: Option<Ref>) -> Result<CallFrame, EngineError> {
        if held.type_name(&args) != Some("tuple") {
            return Err(EngineError::Construction(format!(
                "call frame arguments must be a tuple, not '{}'", held.type_name(&args).unwrap_or("released"))));
        }
        if let Some(ref kw) = kwargs {
            if held.type_name(kw) != Some("mapping") {
                return Err(EngineError::Construction(format!(
                    "call frame keywords must be a mapping, not '{}'", held.type_name(kw).unwrap_or("released"))));
            }
        }
        Ok(CallFrame {
            args: args,
            kwargs: kwargs,
        })
    }

    pub fn args(&self) -> &Ref {
        &self.args
    }

    pub fn kwargs(&self) -> Option<&Ref> {
        self.kwargs.as_ref()
    }

    pub fn invoke(&self, held: Held<'_>, callable: &dyn AsObject) -> Result<Ref, EngineError> {
        held.call(callable, &self.args, self.kwargs.as_ref().map(|k| k as &dyn AsObject))
    }
}

/// The pending result of a dispatched invocation.
pub struct Invocation {
    worker: String,
    rx: oneshot::Receiver<Result<Ref, EngineError>>,
}

impl Invocation {
    pub fn worker(&self) -> &str {
        &self.worker
    }
}

impl Future for Invocation {
    type Item = Ref;
    type Error = EngineError;

    fn poll(&mut self) -> Poll<Ref, EngineError> {
        match self.rx.poll() {
            Ok(Async::Ready(Ok(r))) => Ok(Async::Ready(r)),
            Ok(Async::Ready(Err(e))) => Err(e),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(oneshot::Canceled) => Err(EngineError::Invocation(
                format!("worker {} exited without a result", self.worker))),
        }
    }
}

/// Starts `invocable` on a new worker thread.
///
/// `barrier`, if given, is signalled once the worker is done with the lock, whether the call
/// succeeded, failed or panicked, and also if the worker could not be spawned at all.
pub fn dispatch(interp: &Interpreter, invocable: Arc<Invocable>, frame: Arc<CallFrame>,
                barrier: Option<Arc<CompletionBarrier>>) -> Result<Invocation, EngineError> {
    let name = format!("{}-{}", interp.config().worker_name_prefix, WORKER_SEQ.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = oneshot::channel();
    let arrival = barrier.as_ref().map(|b| b.arrival());
    let worker_interp = interp.clone();
    let worker_name = name.clone();

    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let _arrival = arrival;
        let result = run_worker(&worker_interp, &invocable, &frame);
        // Our handles on shared objects go before we signal.
        drop(invocable);
        drop(frame);
        if let Err(ref e) = result {
            tracing::debug!(worker = %worker_name, error = %e, "invocation failed");
        }
        let _ = tx.send(result);
    });

    match spawned {
        Ok(_) => {
            tracing::debug!(worker = %name, "dispatched invocation");
            Ok(Invocation {
                worker: name,
                rx: rx,
            })
        }
        Err(e) => Err(EngineError::Invocation(format!("failed to spawn worker {}: {}", name, e))),
    }
}

fn run_worker(interp: &Interpreter, invocable: &Invocable, frame: &CallFrame) -> Result<Ref, EngineError> {
    let _binding = if interp.config().bind_worker_context {
        Some(interp.bind_current_thread())
    } else {
        None
    };
    let gil = interp.acquire()?;
    let result = invocable.invoke(gil.held(), frame);
    gil.release()?;
    result
}

/// Runs every (invocable, frame) pair on its own worker and collects the results in order.
///
/// Releases the lock for the duration and takes it back before returning. Every worker is
/// waited for even when some fail; the first error is returned.
pub fn dispatch_all(rt: &mut Runtime, jobs: &[(Arc<Invocable>, Arc<CallFrame>)]) -> Result<Vec<Ref>, EngineError> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let interp = rt.interpreter().clone();
    let barrier = Arc::new(CompletionBarrier::new(jobs.len()));
    let token = rt.save_and_release()?;

    let mut invocations = Vec::with_capacity(jobs.len());
    let mut spawn_error = None;
    for &(ref invocable, ref frame) in jobs {
        match dispatch(&interp, invocable.clone(), frame.clone(), Some(barrier.clone())) {
            Ok(inv) => invocations.push(inv),
            Err(e) => {
                tracing::error!(error = %e, "dispatch failed");
                spawn_error.get_or_insert(e);
            }
        }
    }

    barrier.wait();
    rt.restore_and_acquire(token)?;
    tracing::debug!(workers = jobs.len(), "all workers finished");

    // Every worker has sent by now, so this does not block.
    let results = future::join_all(invocations).wait();
    match spawn_error {
        Some(e) => Err(e),
        None => results,
    }
}
