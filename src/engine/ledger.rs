//! Ownership bookkeeping for engine references.
//!
//! Every New reference handed out by the engine is a claim. A claim starts out owned by
//! whoever received it, may be stolen once by a container, and is released exactly once:
//! by its owner, or by the container's teardown if it was stolen.

use std::collections::HashMap;
use std::fmt;

use crate::error::LockViolation;

use super::heap::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId(u64);

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "claim#{}", self.0)
    }
}

/// Who is responsible for releasing a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The holder owns one count and must release it.
    New,
    /// Transferred into a container; only the container's teardown releases it.
    Stolen,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub created: u64,
    pub released: u64,
    pub stolen: u64,
    /// Claims not yet released.
    pub live: u64,
}

impl LedgerStats {
    /// Every claim ever created has been released exactly once.
    pub fn balanced(&self) -> bool {
        self.live == 0 && self.created == self.released
    }
}

struct Claim {
    object: ObjectId,
    class: Ownership,
}

/// Only unreleased claims are kept. Ids are issued in order, so a missing id below `next` was
/// released and one at or above it was never issued.
pub struct Ledger {
    claims: HashMap<ClaimId, Claim>,
    next: u64,
    stats: LedgerStats,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            claims: HashMap::new(),
            next: 1,
            stats: LedgerStats::default(),
        }
    }

    pub fn issue(&mut self, object: ObjectId) -> ClaimId {
        let id = ClaimId(self.next);
        self.next += 1;
        self.claims.insert(id, Claim {
            object: object,
            class: Ownership::New,
        });
        self.stats.created += 1;
        self.stats.live += 1;
        id
    }

    pub fn class(&self, claim: ClaimId) -> Option<Ownership> {
        match self.claims.get(&claim) {
            Some(c) => Some(c.class),
            None if self.was_issued(claim) => Some(Ownership::Released),
            None => None,
        }
    }

    pub fn object(&self, claim: ClaimId) -> Option<ObjectId> {
        self.claims.get(&claim).map(|c| c.object)
    }

    /// Moves an owned claim into a container.
    pub fn steal(&mut self, claim: ClaimId) -> Result<ObjectId, LockViolation> {
        let missing = self.missing(claim);
        let c = self.claims.get_mut(&claim).ok_or(missing)?;
        match c.class {
            Ownership::New => {
                c.class = Ownership::Stolen;
                self.stats.stolen += 1;
                Ok(c.object)
            }
            Ownership::Stolen => Err(LockViolation::ReleaseOfStolen),
            Ownership::Released => Err(LockViolation::DoubleRelease),
        }
    }

    /// Releases a claim its holder owns.
    pub fn release_owned(&mut self, claim: ClaimId) -> Result<ObjectId, LockViolation> {
        self.release_as(claim, Ownership::New)
    }

    /// Releases a claim a container stole, during that container's teardown.
    pub fn release_stolen(&mut self, claim: ClaimId) -> Result<ObjectId, LockViolation> {
        self.release_as(claim, Ownership::Stolen)
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Claims still owned by someone, for leak reports.
    pub fn live_claims(&self) -> Vec<(ClaimId, ObjectId, Ownership)> {
        let mut v: Vec<_> = self.claims.iter()
            .map(|(&id, c)| (id, c.object, c.class))
            .collect();
        v.sort_by_key(|&(id, _, _)| id);
        v
    }

    fn release_as(&mut self, claim: ClaimId, expected: Ownership) -> Result<ObjectId, LockViolation> {
        let class = self.class(claim).ok_or(LockViolation::UnknownClaim)?;
        match (class, expected) {
            (Ownership::Released, _) => Err(LockViolation::DoubleRelease),
            (Ownership::Stolen, Ownership::New) => Err(LockViolation::ReleaseOfStolen),
            (Ownership::New, Ownership::Stolen) => Err(LockViolation::NotOwner),
            _ => {
                let c = self.claims.remove(&claim).ok_or(LockViolation::UnknownClaim)?;
                self.stats.released += 1;
                self.stats.live -= 1;
                Ok(c.object)
            }
        }
    }

    fn was_issued(&self, claim: ClaimId) -> bool {
        claim.0 >= 1 && claim.0 < self.next
    }

    /// The violation for a claim that is not in the map.
    fn missing(&self, claim: ClaimId) -> LockViolation {
        if self.was_issued(claim) {
            LockViolation::DoubleRelease
        } else {
            LockViolation::UnknownClaim
        }
    }
}
