//! Object handle registry
//!
//! Arena of host object references keyed by generational handles. A slot is
//! reused only after its generation has been bumped, so an old alias of a
//! released handle can never reach the new occupant: it fails with
//! `StaleHandle` instead.
//!
//! Strong entries own a reference and keep the object alive until released.
//! Since objects live in `Rc` allocations they never move while an entry
//! holds them. Weak entries are lookups only and go stale when the host
//! drops the object.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostObject, ObjectRef, TypeId};

/// Script-visible key of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    /// Slot index
    pub index: u32,
    /// Generation of the slot when the handle was issued
    pub generation: u32,
}

impl ObjectHandle {
    /// Pack into a single integer (generation in the high half)
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack from [`to_raw`](Self::to_raw)
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.to_raw())
    }
}

/// Ownership mode of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Registry keeps the object alive until release
    Strong,
    /// Lookup only; the host owns the object
    Weak,
}

enum Entry {
    Strong(ObjectRef),
    Weak(Weak<HostObject>),
    Class(TypeId),
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// What a handle refers to
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A host object
    Object(ObjectRef),
    /// A class (static side of a type)
    Class(TypeId),
}

/// Generational arena of host references.
#[derive(Default)]
pub struct HandleRegistry {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
}

impl HandleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, entry: Entry) -> ObjectHandle {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            ObjectHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            ObjectHandle { index, generation: 0 }
        }
    }

    /// Register an object. Every call issues a new handle.
    pub fn wrap(&mut self, object: &ObjectRef, ownership: Ownership) -> ObjectHandle {
        let entry = match ownership {
            Ownership::Strong => Entry::Strong(Rc::clone(object)),
            Ownership::Weak => Entry::Weak(Rc::downgrade(object)),
        };
        let handle = self.insert(entry);
        log::trace!("wrap {:?} -> {}", ownership, handle);
        handle
    }

    /// Register the static side of a type
    pub fn wrap_class(&mut self, ty: TypeId) -> ObjectHandle {
        self.insert(Entry::Class(ty))
    }

    fn entry(&self, handle: ObjectHandle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    /// What a handle refers to
    pub fn resolve(&self, handle: ObjectHandle) -> BridgeResult<Resolved> {
        match self.entry(handle) {
            Some(Entry::Strong(obj)) => Ok(Resolved::Object(Rc::clone(obj))),
            Some(Entry::Weak(weak)) => weak
                .upgrade()
                .map(Resolved::Object)
                .ok_or(BridgeError::StaleHandle(handle)),
            Some(Entry::Class(ty)) => Ok(Resolved::Class(*ty)),
            None => Err(BridgeError::StaleHandle(handle)),
        }
    }

    /// Object a handle refers to
    pub fn unwrap(&self, handle: ObjectHandle) -> BridgeResult<ObjectRef> {
        match self.resolve(handle)? {
            Resolved::Object(obj) => Ok(obj),
            Resolved::Class(_) => Err(BridgeError::conversion("object instance", "class")),
        }
    }

    /// Whether a handle is live (weak entries count only while the host
    /// object exists)
    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Whether a handle was issued and not yet released. Unlike
    /// [`contains`](Self::contains) this holds for weak entries whose object
    /// is gone.
    pub fn is_issued(&self, handle: ObjectHandle) -> bool {
        self.entry(handle).is_some()
    }

    /// Retire a handle.
    ///
    /// Must be called at most once per issued handle. A second release is a
    /// programming error: it panics in debug builds and returns
    /// `StaleHandle` otherwise.
    pub fn release(&mut self, handle: ObjectHandle) -> BridgeResult<()> {
        let slot = match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.entry.is_some() => slot,
            _ => {
                debug_assert!(false, "release of dead handle {}", handle);
                return Err(BridgeError::StaleHandle(handle));
            }
        };
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.live -= 1;
        log::trace!("release {}", handle);
        Ok(())
    }

    /// Number of issued, unreleased handles
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no handle is outstanding
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .field("free_count", &self.free_list.len())
            .finish()
    }
}
