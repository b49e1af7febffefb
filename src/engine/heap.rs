//! The engine's object heap.
//!
//! Objects are reference counted. An object's count is the number of unreleased claims that
//! point at it, so the heap and the ledger always agree. Containers hold stolen claims on their
//! members and release them when the container itself dies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;

use crate::error::{ErrorKind, LockViolation, PendingError};

use super::ledger::{ClaimId, Ledger};
use super::module::Native;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    #[cfg(test)]
    pub(crate) fn new(id: u64) -> Self {
        ObjectId(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

pub(crate) enum Value {
    None,
    Int(i64),
    Str(String),
    /// Slots start empty and are filled by stealing.
    Tuple(Vec<Option<ClaimId>>),
    Mapping(Vec<(String, ClaimId)>),
    Module {
        name: String,
        attrs: BTreeMap<String, ClaimId>,
    },
    Native(Native),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match *self {
            Value::None => "NoneType",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::Mapping(_) => "mapping",
            Value::Module { .. } => "module",
            Value::Native(_) => "native",
        }
    }

    /// The claims this value holds on other objects.
    fn member_claims(&self) -> Vec<ClaimId> {
        match *self {
            Value::Tuple(ref slots) => slots.iter().filter_map(|s| *s).collect(),
            Value::Mapping(ref entries) => entries.iter().map(|&(_, c)| c).collect(),
            Value::Module { ref attrs, .. } => attrs.values().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

struct Object {
    refcnt: usize,
    value: Value,
}

/// Values torn down by a release. The caller drops them once the heap is unlocked, since a
/// native's closure may own handles whose drop comes back into the heap.
#[must_use]
pub(crate) struct Garbage(Vec<Value>);

impl Garbage {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

pub(crate) struct Heap {
    objects: HashMap<ObjectId, Object>,
    ledger: Ledger,
    next: u64,
}

fn construction<S: Into<String>>(msg: S) -> PendingError {
    PendingError::new(ErrorKind::Construction, msg)
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: HashMap::new(),
            ledger: Ledger::new(),
            next: 1,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Allocates an object and issues the first claim on it.
    pub fn alloc(&mut self, value: Value) -> (ObjectId, ClaimId) {
        let id = ObjectId(self.next);
        self.next += 1;
        self.objects.insert(id, Object {
            refcnt: 1,
            value: value,
        });
        (id, self.ledger.issue(id))
    }

    /// Issues another claim on a live object.
    pub fn claim(&mut self, id: ObjectId) -> Option<ClaimId> {
        let o = self.objects.get_mut(&id)?;
        o.refcnt += 1;
        Some(self.ledger.issue(id))
    }

    pub fn get(&self, id: ObjectId) -> Option<&Value> {
        self.objects.get(&id).map(|o| &o.value)
    }

    pub fn refcnt(&self, id: ObjectId) -> usize {
        self.objects.get(&id).map_or(0, |o| o.refcnt)
    }

    /// The object a container member claim points at.
    pub fn member(&self, claim: ClaimId) -> Option<ObjectId> {
        self.ledger.object(claim)
    }

    pub fn steal(&mut self, claim: ClaimId) -> Result<ObjectId, LockViolation> {
        self.ledger.steal(claim)
    }

    /// Releases a claim its holder owns.
    pub fn release(&mut self, claim: ClaimId) -> Result<Garbage, LockViolation> {
        let id = self.ledger.release_owned(claim)?;
        Ok(self.decref(id))
    }

    /// Puts `claim` into slot `index`, stealing it. The tuple must not be shared yet.
    pub fn tuple_set(&mut self, tuple: ObjectId, index: usize, claim: ClaimId) -> Result<Garbage, PendingError> {
        {
            let o = self.objects.get(&tuple).ok_or_else(|| construction("tuple has been released"))?;
            let len = match o.value {
                Value::Tuple(ref slots) => slots.len(),
                ref other => return Err(construction(format!(
                    "tuple_set expected a tuple, got '{}'", other.type_name()))),
            };
            if o.refcnt != 1 {
                return Err(construction("tuple_set on a tuple that is already shared"));
            }
            if index >= len {
                return Err(construction(format!(
                    "tuple assignment index {} out of range for length {}", index, len)));
            }
        }

        self.ledger.steal(claim).map_err(|v| PendingError::new(ErrorKind::LockProtocol, v.to_string()))?;
        let old = match self.objects.get_mut(&tuple).map(|o| &mut o.value) {
            Some(&mut Value::Tuple(ref mut slots)) => mem::replace(&mut slots[index], Some(claim)),
            _ => None,
        };
        Ok(self.release_member(old))
    }

    /// Binds `key` to a fresh claim on `value`. Does not consume the caller's reference.
    pub fn mapping_set(&mut self, mapping: ObjectId, key: &str, value: ObjectId) -> Result<Garbage, PendingError> {
        match self.get(mapping) {
            Some(&Value::Mapping(_)) => (),
            Some(other) => return Err(construction(format!(
                "mapping_set expected a mapping, got '{}'", other.type_name()))),
            None => return Err(construction("mapping has been released")),
        }
        let claim = self.claim(value).ok_or_else(|| construction("mapping value has been released"))?;
        self.ledger.steal(claim).map_err(|v| PendingError::new(ErrorKind::LockProtocol, v.to_string()))?;

        let old = match self.objects.get_mut(&mapping).map(|o| &mut o.value) {
            Some(&mut Value::Mapping(ref mut entries)) => {
                match entries.iter_mut().find(|e| e.0 == key) {
                    Some(entry) => Some(mem::replace(&mut entry.1, claim)),
                    None => {
                        entries.push((key.to_owned(), claim));
                        None
                    }
                }
            }
            _ => None,
        };
        Ok(self.release_member(old))
    }

    fn release_member(&mut self, claim: Option<ClaimId>) -> Garbage {
        match claim.map(|c| self.ledger.release_stolen(c)) {
            Some(Ok(id)) => self.decref(id),
            Some(Err(v)) => {
                tracing::error!(violation = %v, "container member in inconsistent state");
                Garbage(Vec::new())
            }
            None => Garbage(Vec::new()),
        }
    }

    /// Drops one count on `first`, tearing down everything that dies as a result.
    fn decref(&mut self, first: ObjectId) -> Garbage {
        let mut garbage = Vec::new();
        let mut work = vec![first];

        while let Some(id) = work.pop() {
            let dead = match self.objects.get_mut(&id) {
                Some(o) => {
                    o.refcnt -= 1;
                    o.refcnt == 0
                }
                None => {
                    tracing::error!(object = %id, "release of an object that no longer exists");
                    false
                }
            };
            if !dead {
                continue;
            }

            if let Some(o) = self.objects.remove(&id) {
                for c in o.value.member_claims() {
                    match self.ledger.release_stolen(c) {
                        Ok(member) => work.push(member),
                        Err(v) => tracing::error!(claim = %c, violation = %v, "bad member claim"),
                    }
                }
                tracing::trace!(object = %id, kind = o.value.type_name(), "deallocated");
                garbage.push(o.value);
            }
        }

        Garbage(garbage)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::ledger::Ownership;

    #[test]
    fn last_release_deallocates() {
        let mut h = Heap::new();
        let (id, c1) = h.alloc(Value::Int(5));
        let c2 = h.claim(id).unwrap();
        assert_eq!(h.refcnt(id), 2);

        assert_eq!(h.release(c1).unwrap().len(), 0);
        assert_eq!(h.refcnt(id), 1);
        assert_eq!(h.release(c2).unwrap().len(), 1);
        assert!(h.get(id).is_none());
        assert!(h.ledger().stats().balanced());
    }

    #[test]
    fn tuple_teardown_releases_stolen_members() {
        let mut h = Heap::new();
        let (t, tc) = h.alloc(Value::Tuple(vec![None, None]));
        let (i, ic) = h.alloc(Value::Int(50));
        drop(h.tuple_set(t, 1, ic).unwrap());
        assert_eq!(h.ledger().class(ic), Some(Ownership::Stolen));

        let garbage = h.release(tc).unwrap();
        assert_eq!(garbage.len(), 2);
        assert!(h.get(i).is_none());
        assert_eq!(h.len(), 0);
        assert!(h.ledger().stats().balanced());
    }

    #[test]
    fn tuple_set_out_of_range_leaves_value_owned() {
        let mut h = Heap::new();
        let (t, _) = h.alloc(Value::Tuple(vec![None]));
        let (_, ic) = h.alloc(Value::Int(1));
        let err = h.tuple_set(t, 3, ic).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Construction);
        assert_eq!(h.ledger().class(ic), Some(Ownership::New));
    }

    #[test]
    fn tuple_set_refuses_shared_tuples() {
        let mut h = Heap::new();
        let (t, _) = h.alloc(Value::Tuple(vec![None]));
        h.claim(t).unwrap();
        let (_, ic) = h.alloc(Value::Int(1));
        assert!(h.tuple_set(t, 0, ic).is_err());
    }

    #[test]
    fn replacing_a_slot_releases_the_old_member() {
        let mut h = Heap::new();
        let (t, _) = h.alloc(Value::Tuple(vec![None]));
        let (a, ac) = h.alloc(Value::Int(1));
        let (_, bc) = h.alloc(Value::Int(2));
        drop(h.tuple_set(t, 0, ac).unwrap());
        assert_eq!(h.tuple_set(t, 0, bc).unwrap().len(), 1);
        assert!(h.get(a).is_none());
    }

    #[test]
    fn mapping_set_keeps_keys_unique() {
        let mut h = Heap::new();
        let (m, mc) = h.alloc(Value::Mapping(Vec::new()));
        let (v, vc) = h.alloc(Value::Int(1));
        drop(h.mapping_set(m, "limit", v).unwrap());
        drop(h.mapping_set(m, "limit", v).unwrap());
        assert_eq!(h.refcnt(v), 2);
        match h.get(m) {
            Some(&Value::Mapping(ref entries)) => assert_eq!(entries.len(), 1),
            _ => panic!("not a mapping"),
        }

        drop(h.release(vc).unwrap());
        drop(h.release(mc).unwrap());
        assert_eq!(h.len(), 0);
        assert!(h.ledger().stats().balanced());
    }
}
