//! The embedded engine: a single-threaded object heap whose state may only be touched by the
//! thread holding the global lock.
//!
//! `Interpreter` is the shareable handle (clone it into workers). `GilGuard` is a worker's
//! scoped hold on the lock. `Held` is the proof that the current thread holds the lock, and every
//! engine operation hangs off it. A `Held` cannot outlive the hold it came from and cannot leave
//! its thread.
//!
//! Operations follow the embedding convention of the engine: internally a failing operation
//! produces no object and leaves a pending error; the public methods drain that into a `Result`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::error::{EngineError, ErrorKind, ErrorReporter, ErrorSurface, LockViolation, PendingError};
use crate::lock::{GlobalLock, LockStats, ThreadContext};

mod heap;
mod ledger;
mod module;
mod object;


pub use self::heap::ObjectId;
pub use self::ledger::{ClaimId, LedgerStats, Ownership};
pub use self::module::{Args, ModuleDef, NativeFn};
pub use self::object::{AsObject, BorrowedRef, Ref};

use self::heap::{Heap, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvokeStats {
    pub calls: u64,
    /// Invocations currently executing engine code.
    pub active: usize,
    /// The most invocations ever seen executing at once.
    pub peak: usize,
}

#[derive(Default)]
struct InvokeProbe {
    calls: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ProbeEntry<'a>(&'a InvokeProbe);

impl InvokeProbe {
    fn enter(&self) -> ProbeEntry<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeEntry(self)
    }

    fn stats(&self) -> InvokeStats {
        InvokeStats {
            calls: self.calls.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
        }
    }
}

impl<'a> Drop for ProbeEntry<'a> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Modules {
    defs: HashMap<String, ModuleDef>,
    /// Imported modules. The runtime owns these claims until finalize.
    loaded: BTreeMap<String, ClaimId>,
}

struct Contexts {
    bound: HashMap<ThreadId, ThreadContext>,
    next: u64,
}

/// Shared engine state. Lock order: `modules` before `heap`.
pub(crate) struct Core {
    config: RuntimeConfig,
    pub(crate) lock: GlobalLock,
    heap: Mutex<Heap>,
    modules: Mutex<Modules>,
    errors: ErrorSurface,
    reporter: Arc<dyn ErrorReporter>,
    /// Releases from threads that did not hold the lock.
    deferred: Mutex<Vec<ClaimId>>,
    contexts: Mutex<Contexts>,
    /// Context of the current lock holder.
    current: Mutex<Option<ThreadContext>>,
    probe: InvokeProbe,
    finalized: AtomicBool,
}

impl Core {
    /// Builds the engine with the lock held by the calling thread, which gets a bound context.
    fn new(config: RuntimeConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        let core = Core {
            config: config,
            lock: GlobalLock::new_held(),
            heap: Mutex::new(Heap::new()),
            modules: Mutex::new(Modules {
                defs: HashMap::new(),
                loaded: BTreeMap::new(),
            }),
            errors: ErrorSurface::new(),
            reporter: reporter,
            deferred: Mutex::new(Vec::new()),
            contexts: Mutex::new(Contexts {
                bound: HashMap::new(),
                next: 1,
            }),
            current: Mutex::new(None),
            probe: InvokeProbe::default(),
            finalized: AtomicBool::new(false),
        };
        let (ctx, _) = core.bind_current_thread();
        *core.current.lock() = Some(ctx);
        core
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub(crate) fn release_or_defer(&self, claim: ClaimId) {
        if self.is_finalized() {
            tracing::trace!(claim = %claim, "release after finalize ignored");
            return;
        }
        if self.lock.is_held_by_current_thread() {
            if let Err(v) = self.release_now(claim) {
                tracing::error!(claim = %claim, violation = %v, "reference release failed");
            }
        } else {
            tracing::debug!(claim = %claim, "engine lock not held; release deferred");
            self.deferred.lock().push(claim);
        }
    }

    fn release_now(&self, claim: ClaimId) -> Result<(), LockViolation> {
        let garbage = self.heap.lock().release(claim)?;
        drop(garbage);
        Ok(())
    }

    /// Performs releases queued by threads that did not hold the lock. Caller holds the lock.
    fn drain_deferred(&self) -> usize {
        let pending = mem::replace(&mut *self.deferred.lock(), Vec::new());
        for &claim in &pending {
            if let Err(v) = self.release_now(claim) {
                tracing::error!(claim = %claim, violation = %v, "deferred release failed");
            }
        }
        pending.len()
    }

    /// Returns the thread's context, registering one if needed, and whether it was new.
    fn bind_current_thread(&self) -> (ThreadContext, bool) {
        let me = thread::current().id();
        let mut contexts = self.contexts.lock();
        if let Some(&ctx) = contexts.bound.get(&me) {
            return (ctx, false);
        }
        let ctx = ThreadContext {
            id: contexts.next,
            bound: true,
        };
        contexts.next += 1;
        contexts.bound.insert(me, ctx);
        (ctx, true)
    }

    fn unbind(&self, thread: ThreadId) {
        self.contexts.lock().bound.remove(&thread);
    }

    /// The bound context of the calling thread, or a fresh transient one.
    fn context_for_current_thread(&self) -> ThreadContext {
        let me = thread::current().id();
        let mut contexts = self.contexts.lock();
        match contexts.bound.get(&me) {
            Some(&ctx) => ctx,
            None => {
                let ctx = ThreadContext {
                    id: contexts.next,
                    bound: false,
                };
                contexts.next += 1;
                ctx
            }
        }
    }

    /// Called right after this thread obtained the lock.
    pub(crate) fn enter(&self, ctx: Option<ThreadContext>) {
        *self.current.lock() = ctx;
        let drained = self.drain_deferred();
        if drained > 0 {
            tracing::debug!(count = drained, "performed deferred releases");
        }
    }

    /// Called right before this thread gives up the lock.
    pub(crate) fn leave(&self) -> Option<ThreadContext> {
        self.current.lock().take()
    }

    pub(crate) fn current_context(&self) -> Option<ThreadContext> {
        *self.current.lock()
    }

    /// Tears the engine down. The caller must hold the lock with no token outstanding.
    pub(crate) fn shutdown(&self) -> Result<LedgerStats, EngineError> {
        if !self.lock.is_held_by_current_thread() {
            let v = if self.lock.has_saved_token() {
                LockViolation::TokenOutstanding
            } else {
                LockViolation::NotHolder
            };
            self.finalized.store(true, Ordering::SeqCst);
            return Err(v.into());
        }

        // An error nobody drained gets printed now, once.
        self.errors.print(&*self.reporter);
        self.drain_deferred();

        let cached = mem::replace(&mut self.modules.lock().loaded, BTreeMap::new());
        for (name, claim) in cached {
            if let Err(v) = self.release_now(claim) {
                tracing::error!(module = %name, violation = %v, "failed to release module");
            }
        }
        self.contexts.lock().bound.clear();
        *self.current.lock() = None;

        let (stats, live) = {
            let heap = self.heap.lock();
            (heap.ledger().stats(), heap.ledger().live_claims())
        };
        for &(claim, object, class) in live.iter().take(16) {
            tracing::warn!(claim = %claim, object = %object, class = ?class, "leaked reference");
        }
        if stats.live > 0 {
            tracing::warn!(live = stats.live, "engine finalized with live references");
        }

        self.finalized.store(true, Ordering::SeqCst);
        self.lock.teardown()?;
        tracing::info!(created = stats.created, released = stats.released, stolen = stats.stolen,
            "engine finalized");
        Ok(stats)
    }
}

/// A shareable handle on the engine. Holding one does not hold the lock.
#[derive(Clone)]
pub struct Interpreter {
    core: Arc<Core>,
}

impl Interpreter {
    /// The calling thread holds the lock of the new interpreter.
    pub(crate) fn new(config: RuntimeConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        Interpreter {
            core: Arc::new(Core::new(config, reporter)),
        }
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Self {
        Interpreter {
            core: core,
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    /// Makes a module importable. Host-side only; does not touch engine objects.
    pub fn register_module(&self, def: ModuleDef) {
        let mut modules = self.core.modules.lock();
        if modules.loaded.contains_key(def.name()) {
            tracing::warn!(module = def.name(), "module re-registered after import; cached module kept");
        }
        tracing::debug!(module = def.name(), "registered module");
        modules.defs.insert(def.name().to_owned(), def);
    }

    /// Acquires the lock for a thread with no saved state. Waits as configured.
    pub fn acquire(&self) -> Result<GilGuard<'_>, EngineError> {
        self.acquire_with(self.core.config.acquire_timeout())
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<GilGuard<'_>, EngineError> {
        self.acquire_with(Some(timeout))
    }

    fn acquire_with(&self, timeout: Option<Duration>) -> Result<GilGuard<'_>, EngineError> {
        if self.core.is_finalized() {
            return Err(EngineError::Finalized);
        }
        self.core.lock.acquire(timeout)?;
        if self.core.is_finalized() {
            // Lost a race with shutdown.
            let _ = self.core.lock.release();
            return Err(EngineError::Finalized);
        }

        let ctx = self.core.context_for_current_thread();
        self.core.enter(Some(ctx));
        tracing::trace!(context = ctx.id, bound = ctx.bound, "acquired engine lock");
        Ok(GilGuard {
            core: &self.core,
            context: ctx,
            active: true,
            _not_send: PhantomData,
        })
    }

    /// Registers an engine context for the calling thread until the binding drops.
    pub fn bind_current_thread(&self) -> ThreadBinding {
        let (ctx, owner) = self.core.bind_current_thread();
        ThreadBinding {
            core: self.core.clone(),
            context: ctx,
            owner: owner,
            _not_send: PhantomData,
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.core.lock.is_held_by_current_thread()
    }

    pub fn is_finalized(&self) -> bool {
        self.core.is_finalized()
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.core.heap.lock().ledger().stats()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.core.lock.stats()
    }

    pub fn invoke_stats(&self) -> InvokeStats {
        self.core.probe.stats()
    }

    /// Releases waiting for the next lock acquisition.
    pub fn deferred_releases(&self) -> usize {
        self.core.deferred.lock().len()
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("finalized", &self.core.is_finalized())
            .finish()
    }
}

/// A scoped hold on the lock by a thread with no saved state. Released on drop.
pub struct GilGuard<'a> {
    core: &'a Arc<Core>,
    context: ThreadContext,
    active: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> GilGuard<'a> {
    pub fn held(&self) -> Held<'_> {
        Held::new(self.core)
    }

    pub fn context(&self) -> ThreadContext {
        self.context
    }

    /// Releases explicitly, reporting misuse instead of logging it.
    pub fn release(mut self) -> Result<(), EngineError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), EngineError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.core.leave();
        self.core.lock.release()?;
        tracing::trace!(context = self.context.id, "released engine lock");
        Ok(())
    }
}

impl<'a> Drop for GilGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!(error = %e, "failed to release engine lock");
        }
    }
}

/// Keeps the calling thread's engine context registered.
pub struct ThreadBinding {
    core: Arc<Core>,
    context: ThreadContext,
    owner: bool,
    _not_send: PhantomData<*const ()>,
}

impl ThreadBinding {
    pub fn context(&self) -> ThreadContext {
        self.context
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        if self.owner {
            self.core.unbind(thread::current().id());
        }
    }
}

/// Returned by `Held::tuple_set` when the value was not stolen. The caller still owns `value`.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SetItemError {
    pub error: EngineError,
    pub value: Ref,
}

impl From<SetItemError> for EngineError {
    fn from(e: SetItemError) -> Self {
        e.error
    }
}

/// Proof that the current thread holds the engine lock.
#[derive(Clone, Copy)]
pub struct Held<'a> {
    core: &'a Arc<Core>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Held<'a> {
    pub(crate) fn new(core: &'a Arc<Core>) -> Self {
        Held {
            core: core,
            _not_send: PhantomData,
        }
    }

    fn new_ref(&self, object: ObjectId, claim: ClaimId) -> Ref {
        Ref::new(self.core.clone(), object, claim)
    }

    fn raise<T, S: Into<String>>(&self, kind: ErrorKind, message: S) -> Option<T> {
        self.core.errors.raise(PendingError::new(kind, message));
        None
    }

    fn check<T>(&self, r: Option<T>) -> Result<T, EngineError> {
        self.core.errors.check_result(r)
    }

    fn alloc(&self, value: Value) -> Ref {
        let (id, claim) = self.core.heap.lock().alloc(value);
        self.new_ref(id, claim)
    }

    pub fn context(&self) -> Option<ThreadContext> {
        self.core.current_context()
    }

    // Pending errors.

    /// The pending error's description, if any. Does not clear it.
    pub fn check_error(&self) -> Option<String> {
        self.core.errors.check()
    }

    /// Emits the pending error to the reporter and clears it.
    pub fn print_error(&self) -> bool {
        self.core.errors.print(&*self.core.reporter)
    }

    /// Sets the pending error. For natives that want to fail after the fact.
    pub fn raise_error<S: Into<String>>(&self, kind: ErrorKind, message: S) {
        self.core.errors.raise(PendingError::new(kind, message));
    }

    pub fn take_error(&self) -> Option<EngineError> {
        self.core.errors.take().map(PendingError::into_error)
    }

    // Construction.

    pub fn make_none(&self) -> Ref {
        self.alloc(Value::None)
    }

    pub fn make_int(&self, value: i64) -> Result<Ref, EngineError> {
        Ok(self.alloc(Value::Int(value)))
    }

    pub fn make_str<S: Into<String>>(&self, value: S) -> Result<Ref, EngineError> {
        Ok(self.alloc(Value::Str(value.into())))
    }

    /// A tuple of `len` empty slots, to be filled with `tuple_set` before it is shared.
    pub fn make_tuple(&self, len: usize) -> Result<Ref, EngineError> {
        Ok(self.alloc(Value::Tuple(vec![None; len])))
    }

    pub fn make_mapping(&self) -> Result<Ref, EngineError> {
        Ok(self.alloc(Value::Mapping(Vec::new())))
    }

    /// Steals `value` into slot `index`. On failure nothing is stolen and `value` comes back
    /// inside the error.
    pub fn tuple_set(&self, tuple: &Ref, index: usize, value: Ref) -> Result<(), SetItemError> {
        let outcome = self.core.heap.lock().tuple_set(tuple.object_id(), index, value.claim());
        match outcome {
            Ok(garbage) => {
                value.disarm();
                drop(garbage);
                Ok(())
            }
            Err(p) => Err(SetItemError {
                error: p.into_error(),
                value: value,
            }),
        }
    }

    /// Borrows slot `index`. The view lives no longer than the caller's handle on the tuple.
    pub fn tuple_get<'t, T: AsObject + ?Sized>(&self, tuple: &'t T, index: usize) -> Result<BorrowedRef<'t>, EngineError> {
        let r = self.tuple_get_raw(tuple.object_id(), index);
        self.check(r).map(BorrowedRef::new)
    }

    fn tuple_get_raw(&self, tuple: ObjectId, index: usize) -> Option<ObjectId> {
        let heap = self.core.heap.lock();
        match heap.get(tuple) {
            Some(&Value::Tuple(ref slots)) => match slots.get(index) {
                Some(&Some(claim)) => heap.member(claim),
                Some(&None) => self.raise(ErrorKind::Construction, format!("tuple slot {} is empty", index)),
                None => self.raise(ErrorKind::Construction, format!("tuple index {} out of range", index)),
            },
            Some(other) => self.raise(ErrorKind::Construction,
                format!("expected a tuple, got '{}'", other.type_name())),
            None => self.raise(ErrorKind::Construction, "tuple has been released"),
        }
    }

    pub fn tuple_len<T: AsObject + ?Sized>(&self, tuple: &T) -> Result<usize, EngineError> {
        let r = match self.core.heap.lock().get(tuple.object_id()) {
            Some(&Value::Tuple(ref slots)) => Some(slots.len()),
            Some(other) => self.raise(ErrorKind::Construction,
                format!("expected a tuple, got '{}'", other.type_name())),
            None => self.raise(ErrorKind::Construction, "tuple has been released"),
        };
        self.check(r)
    }

    /// Binds `key` to `value`. Unlike `tuple_set`, the caller keeps its reference.
    pub fn mapping_set<V: AsObject + ?Sized>(&self, mapping: &Ref, key: &str, value: &V) -> Result<(), EngineError> {
        let outcome = self.core.heap.lock().mapping_set(mapping.object_id(), key, value.object_id());
        match outcome {
            Ok(garbage) => {
                drop(garbage);
                Ok(())
            }
            Err(p) => Err(p.into_error()),
        }
    }

    // Inspection.

    pub fn int_value<O: AsObject + ?Sized>(&self, obj: &O) -> Result<i64, EngineError> {
        let r = match self.core.heap.lock().get(obj.object_id()) {
            Some(&Value::Int(i)) => Some(i),
            Some(other) => self.raise(ErrorKind::Construction,
                format!("expected an int, got '{}'", other.type_name())),
            None => self.raise(ErrorKind::Construction, "object has been released"),
        };
        self.check(r)
    }

    pub fn str_value<O: AsObject + ?Sized>(&self, obj: &O) -> Result<String, EngineError> {
        let r = match self.core.heap.lock().get(obj.object_id()) {
            Some(&Value::Str(ref s)) => Some(s.clone()),
            Some(other) => self.raise(ErrorKind::Construction,
                format!("expected a str, got '{}'", other.type_name())),
            None => self.raise(ErrorKind::Construction, "object has been released"),
        };
        self.check(r)
    }

    pub fn type_name<O: AsObject + ?Sized>(&self, obj: &O) -> Option<&'static str> {
        self.core.heap.lock().get(obj.object_id()).map(Value::type_name)
    }

    pub fn is_callable<O: AsObject + ?Sized>(&self, obj: &O) -> bool {
        match self.core.heap.lock().get(obj.object_id()) {
            Some(&Value::Native(_)) => true,
            _ => false,
        }
    }

    pub fn refcount<O: AsObject + ?Sized>(&self, obj: &O) -> usize {
        self.core.heap.lock().refcnt(obj.object_id())
    }

    // References.

    /// A new owned reference to the same object.
    pub fn clone_ref<O: AsObject + ?Sized>(&self, obj: &O) -> Result<Ref, EngineError> {
        let id = obj.object_id();
        let r = match self.core.heap.lock().claim(id) {
            Some(claim) => Some(claim),
            None => self.raise(ErrorKind::Construction, "object has been released"),
        };
        self.check(r).map(|claim| self.new_ref(id, claim))
    }

    pub fn ownership(&self, claim: ClaimId) -> Option<Ownership> {
        self.core.heap.lock().ledger().class(claim)
    }

    /// Releases a detached claim (see `Ref::into_claim`).
    pub fn release_claim(&self, claim: ClaimId) -> Result<(), EngineError> {
        self.core.release_now(claim).map_err(EngineError::from)
    }

    // Modules.

    pub fn import(&self, name: &str) -> Result<Ref, EngineError> {
        let r = self.import_raw(name);
        self.check(r)
    }

    fn import_raw(&self, name: &str) -> Option<Ref> {
        let mut modules = self.core.modules.lock();

        if let Some(&cached) = modules.loaded.get(name) {
            let mut heap = self.core.heap.lock();
            let id = heap.member(cached)?;
            let claim = heap.claim(id)?;
            return Some(self.new_ref(id, claim));
        }

        let (id, cache_claim, claim) = {
            let def = match modules.defs.get(name) {
                Some(def) => def,
                None => return self.raise(ErrorKind::Import, format!("No module named '{}'", name)),
            };

            let mut heap = self.core.heap.lock();
            let mut attrs = BTreeMap::new();
            for (attr, native) in def.natives() {
                let (_, c) = heap.alloc(Value::Native(native));
                heap.steal(c).ok()?;
                attrs.insert(attr.to_owned(), c);
            }
            let (id, cache_claim) = heap.alloc(Value::Module {
                name: name.to_owned(),
                attrs: attrs,
            });
            let claim = heap.claim(id)?;
            (id, cache_claim, claim)
        };
        modules.loaded.insert(name.to_owned(), cache_claim);
        tracing::debug!(module = name, "imported module");

        Some(self.new_ref(id, claim))
    }

    pub fn get_attr<O: AsObject + ?Sized>(&self, obj: &O, name: &str) -> Result<Ref, EngineError> {
        let r = self.get_attr_raw(obj.object_id(), name);
        self.check(r)
    }

    fn get_attr_raw(&self, obj: ObjectId, name: &str) -> Option<Ref> {
        let mut heap = self.core.heap.lock();
        let member = match heap.get(obj) {
            Some(&Value::Module { name: ref module, ref attrs }) => match attrs.get(name) {
                Some(&c) => c,
                None => return self.raise(ErrorKind::Attribute,
                    format!("module '{}' has no attribute '{}'", module, name)),
            },
            Some(other) => return self.raise(ErrorKind::Attribute,
                format!("'{}' object has no attribute '{}'", other.type_name(), name)),
            None => return self.raise(ErrorKind::Attribute, "object has been released"),
        };
        let id = heap.member(member)?;
        let claim = heap.claim(id)?;
        drop(heap);
        Some(self.new_ref(id, claim))
    }

    // Invocation.

    /// Calls `callable` with a positional tuple and an optional keyword mapping.
    pub fn call(&self, callable: &dyn AsObject, args: &dyn AsObject, kwargs: Option<&dyn AsObject>) -> Result<Ref, EngineError> {
        let r = self.call_raw(callable, args, kwargs);
        self.check(r)
    }

    fn call_raw(&self, callable: &dyn AsObject, args: &dyn AsObject, kwargs: Option<&dyn AsObject>) -> Option<Ref> {
        let (native, positional, keywords) = {
            let heap = self.core.heap.lock();

            let native = match heap.get(callable.object_id()) {
                Some(&Value::Native(ref n)) => n.clone(),
                Some(other) => return self.raise(ErrorKind::Invocation,
                    format!("'{}' object is not callable", other.type_name())),
                None => return self.raise(ErrorKind::Invocation, "callable has been released"),
            };

            let positional = match heap.get(args.object_id()) {
                Some(&Value::Tuple(ref slots)) => {
                    let mut v = Vec::with_capacity(slots.len());
                    for (i, slot) in slots.iter().enumerate() {
                        match slot.and_then(|c| heap.member(c)) {
                            Some(id) => v.push(BorrowedRef::new(id)),
                            None => return self.raise(ErrorKind::Invocation,
                                format!("argument {} to {} was never set", i, native.name)),
                        }
                    }
                    v
                }
                Some(other) => return self.raise(ErrorKind::Invocation,
                    format!("arguments must be a tuple, not '{}'", other.type_name())),
                None => return self.raise(ErrorKind::Invocation, "argument tuple has been released"),
            };

            let keywords = match kwargs.map(|k| heap.get(k.object_id())) {
                None => Vec::new(),
                Some(Some(&Value::Mapping(ref entries))) => entries.iter()
                    .filter_map(|&(ref k, c)| heap.member(c).map(|id| (k.clone(), BorrowedRef::new(id))))
                    .collect(),
                Some(Some(other)) => return self.raise(ErrorKind::Invocation,
                    format!("keyword arguments must be a mapping, not '{}'", other.type_name())),
                Some(None) => return self.raise(ErrorKind::Invocation, "keyword mapping has been released"),
            };

            (native, positional, keywords)
        };

        let args = Args::new(positional, keywords);
        let _entry = self.core.probe.enter();
        let _span = tracing::debug_span!("invoke", callable = %native.name).entered();
        match (native.func)(*self, &args) {
            Ok(r) => Some(r),
            Err(e) => {
                self.core.errors.raise(PendingError::from(&e));
                None
            }
        }
    }
}
