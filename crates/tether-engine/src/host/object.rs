//! Host object model
//!
//! Host objects are reference-counted records of value slots: fields for
//! classes and structs, elements for arrays. An `Rc` allocation never moves,
//! so a raw pointer to a live object stays valid for as long as any strong
//! reference (for example a registry entry) is held.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::host::types::HostType;

/// Identity of a type inside a [`TypeDomain`](crate::host::TypeDomain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Shared reference to a host object
pub type ObjectRef = Rc<HostObject>;

/// Reflection-typed host value.
#[derive(Clone, Default)]
pub enum HostValue {
    /// null reference (also the value of `void`)
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer of any width
    Int(i64),
    /// Unsigned integer of any width
    UInt(u64),
    /// Float of any width
    Float(f64),
    /// Byte string
    Str(Rc<[u8]>),
    /// Pointer-sized integer
    Pointer(usize),
    /// Object reference
    Object(ObjectRef),
}

impl HostValue {
    /// Byte string value
    pub fn str(s: impl AsRef<[u8]>) -> Self {
        HostValue::Str(Rc::from(s.as_ref()))
    }

    /// The zero value of `ty`
    pub fn default_for(ty: &HostType) -> Self {
        match ty {
            HostType::Bool => HostValue::Bool(false),
            HostType::Numeric(kind) if !kind.is_integer() => HostValue::Float(0.0),
            HostType::Numeric(kind) if kind.is_unsigned() => HostValue::UInt(0),
            HostType::Numeric(_) => HostValue::Int(0),
            HostType::Pointer => HostValue::Pointer(0),
            _ => HostValue::Null,
        }
    }

    /// Whether this is null
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Numeric value as `i64`, if numeric and representable
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::UInt(u) => i64::try_from(*u).ok(),
            HostValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Numeric value as `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::UInt(u) => Some(*u as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Object reference, if any
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Byte string contents, if any
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by branch instructions
    pub fn truthy(&self) -> bool {
        match self {
            HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Int(i) => *i != 0,
            HostValue::UInt(u) => *u != 0,
            HostValue::Float(f) => *f != 0.0,
            HostValue::Pointer(p) => *p != 0,
            HostValue::Str(_) | HostValue::Object(_) => true,
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::Pointer(a), HostValue::Pointer(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => Rc::ptr_eq(a, b),
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::UInt(a), HostValue::UInt(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(i) => write!(f, "{}", i),
            HostValue::UInt(u) => write!(f, "{}u", u),
            HostValue::Float(x) => write!(f, "{:?}", x),
            HostValue::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            HostValue::Pointer(p) => write!(f, "ptr({:#x})", p),
            HostValue::Object(o) => write!(f, "object(type={}, {:p})", o.type_id().0, Rc::as_ptr(o)),
        }
    }
}

/// A host object: a type identity plus its value slots.
pub struct HostObject {
    type_id: TypeId,
    slots: RefCell<Vec<HostValue>>,
}

impl HostObject {
    /// Allocate an object with the given slots
    pub fn new(type_id: TypeId, slots: Vec<HostValue>) -> ObjectRef {
        Rc::new(HostObject {
            type_id,
            slots: RefCell::new(slots),
        })
    }

    /// Runtime type of the object
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Number of slots (fields or elements)
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Whether the object has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Read a slot
    pub fn get(&self, slot: usize) -> Option<HostValue> {
        self.slots.borrow().get(slot).cloned()
    }

    /// Write a slot; returns false if the slot does not exist
    pub fn set(&self, slot: usize, value: HostValue) -> bool {
        match self.slots.borrow_mut().get_mut(slot) {
            Some(target) => {
                *target = value;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every slot
    pub fn slots(&self) -> Vec<HostValue> {
        self.slots.borrow().clone()
    }

    /// Shallow copy with the same type (value-type semantics)
    pub fn duplicate(&self) -> ObjectRef {
        HostObject::new(self.type_id, self.slots())
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("type_id", &self.type_id.0)
            .field("slots", &self.len())
            .finish()
    }
}
