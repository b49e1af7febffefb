//! Handles to engine objects.
//!
//! `Ref` owns one claim (a New reference) and releases it when dropped. `BorrowedRef` is a view
//! that owns nothing; its lifetime keeps it inside the scope of whatever owns the object.
//! Stealing is a move: the steal operations take a `Ref` by value, so the source variable
//! cannot be used or released afterwards.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::heap::ObjectId;
use super::ledger::ClaimId;
use super::Core;

/// Anything that names an engine object.
pub trait AsObject {
    fn object_id(&self) -> ObjectId;
}

/// An owned reference.
///
/// `Ref` is `Send`, so results can travel back from worker threads. Dropping it on a thread
/// that holds the engine lock releases it immediately; anywhere else the release is queued
/// and performed by the next thread to acquire the lock.
pub struct Ref {
    core: Arc<Core>,
    object: ObjectId,
    claim: ClaimId,
    armed: bool,
}

impl Ref {
    pub(crate) fn new(core: Arc<Core>, object: ObjectId, claim: ClaimId) -> Self {
        Ref {
            core: core,
            object: object,
            claim: claim,
            armed: true,
        }
    }

    pub fn claim(&self) -> ClaimId {
        self.claim
    }

    pub fn borrow(&self) -> BorrowedRef<'_> {
        BorrowedRef::new(self.object)
    }

    /// Detaches the claim without releasing it. Whoever holds the id is now responsible for
    /// `Held::release_claim`.
    pub fn into_claim(mut self) -> ClaimId {
        self.armed = false;
        self.claim
    }

    /// Marks the claim as transferred into a container.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl AsObject for Ref {
    fn object_id(&self) -> ObjectId {
        self.object
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ref({}, {})", self.object, self.claim)
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        if self.armed {
            self.core.release_or_defer(self.claim);
        }
    }
}

/// A non-owning view. Never released.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BorrowedRef<'a> {
    object: ObjectId,
    _marker: PhantomData<&'a ()>,
}

impl<'a> BorrowedRef<'a> {
    pub(crate) fn new(object: ObjectId) -> Self {
        BorrowedRef {
            object: object,
            _marker: PhantomData,
        }
    }
}

impl<'a> AsObject for BorrowedRef<'a> {
    fn object_id(&self) -> ObjectId {
        self.object
    }
}

impl<'a> fmt::Debug for BorrowedRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BorrowedRef({})", self.object)
    }
}
