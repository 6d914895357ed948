//! Script value representation
//!
//! Every value on the script stack is a [`ScriptValue`] with exactly one tag.
//! Opaque handles are never coerced into numbers: a handle only ever reads
//! back as a handle.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::ScriptError;
use crate::vm::ScriptState;

/// Body of a callable script value.
///
/// Follows the C-function convention of embeddable VMs: arguments are the
/// values of the current frame (index 1 is the first argument), results are
/// pushed onto the stack and their count is returned.
pub type NativeBody = dyn Fn(&mut ScriptState) -> Result<usize, ScriptError>;

/// Index of a metatable registered with a [`ScriptState`]
pub type MetaKey = u32;

/// Discriminant of a [`ScriptValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptTag {
    /// nil
    Nil,
    /// boolean
    Bool,
    /// double precision number
    Number,
    /// byte string
    String,
    /// raw pointer-sized value
    LightPointer,
    /// opaque handle to a host object
    Handle,
    /// callable
    Function,
}

impl ScriptTag {
    /// Script-facing type name
    pub fn name(self) -> &'static str {
        match self {
            ScriptTag::Nil => "nil",
            ScriptTag::Bool => "boolean",
            ScriptTag::Number => "number",
            ScriptTag::String => "string",
            ScriptTag::LightPointer => "lightpointer",
            ScriptTag::Handle => "handle",
            ScriptTag::Function => "function",
        }
    }
}

impl fmt::Display for ScriptTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tagged union of every value that can cross the script/host boundary.
#[derive(Clone, Default)]
pub enum ScriptValue {
    /// nil
    #[default]
    Nil,
    /// boolean
    Bool(bool),
    /// double precision number
    Number(f64),
    /// byte string, no encoding implied
    String(Rc<[u8]>),
    /// raw pointer-sized value
    LightPointer(usize),
    /// opaque handle wrapper
    Handle(UserData),
    /// callable
    Function(FunctionRef),
}

impl ScriptValue {
    /// Create a string value from raw bytes
    pub fn string(bytes: impl AsRef<[u8]>) -> Self {
        ScriptValue::String(Rc::from(bytes.as_ref()))
    }

    /// Get the tag of this value
    pub fn tag(&self) -> ScriptTag {
        match self {
            ScriptValue::Nil => ScriptTag::Nil,
            ScriptValue::Bool(_) => ScriptTag::Bool,
            ScriptValue::Number(_) => ScriptTag::Number,
            ScriptValue::String(_) => ScriptTag::String,
            ScriptValue::LightPointer(_) => ScriptTag::LightPointer,
            ScriptValue::Handle(_) => ScriptTag::Handle,
            ScriptValue::Function(_) => ScriptTag::Function,
        }
    }

    /// Check if this is nil
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// Truthiness: only nil and false are false
    pub fn truthy(&self) -> bool {
        !matches!(self, ScriptValue::Nil | ScriptValue::Bool(false))
    }

    /// Get as boolean if this is a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as number if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the raw bytes if this is a string
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as UTF-8 text if this is a string holding valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Get the handle wrapper if this is a handle
    pub fn as_userdata(&self) -> Option<&UserData> {
        match self {
            ScriptValue::Handle(u) => Some(u),
            _ => None,
        }
    }

    /// Get the function if this is a function
    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            ScriptValue::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
            (ScriptValue::LightPointer(a), ScriptValue::LightPointer(b)) => a == b,
            (ScriptValue::Handle(a), ScriptValue::Handle(b)) => a.ptr_eq(b),
            (ScriptValue::Function(a), ScriptValue::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => write!(f, "{}", n),
            ScriptValue::String(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            ScriptValue::LightPointer(p) => write!(f, "lightpointer({:#x})", p),
            ScriptValue::Handle(u) => write!(f, "handle({:#x}, meta={})", u.slot(), u.meta()),
            ScriptValue::Function(func) => write!(f, "function({})", func.name()),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Number(n as f64)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::string(s)
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::string(s)
    }
}

impl From<FunctionRef> for ScriptValue {
    fn from(f: FunctionRef) -> Self {
        ScriptValue::Function(f)
    }
}

// ============================================================================
// Functions
// ============================================================================

/// A callable script value.
pub struct ScriptFunction {
    name: String,
    prototype: Option<String>,
    body: Rc<NativeBody>,
}

/// Shared reference to a [`ScriptFunction`]
#[derive(Clone)]
pub struct FunctionRef(Rc<ScriptFunction>);

impl FunctionRef {
    /// Create a function from a native body
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut ScriptState) -> Result<usize, ScriptError> + 'static,
    ) -> Self {
        FunctionRef(Rc::new(ScriptFunction {
            name: name.into(),
            prototype: None,
            body: Rc::new(body),
        }))
    }

    pub(crate) fn from_prototype(name: &str, body: Rc<NativeBody>) -> Self {
        FunctionRef(Rc::new(ScriptFunction {
            name: name.to_string(),
            prototype: Some(name.to_string()),
            body,
        }))
    }

    /// Function name used in tracebacks
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Prototype name, if this function can be dumped
    pub fn prototype(&self) -> Option<&str> {
        self.0.prototype.as_deref()
    }

    pub(crate) fn body(&self) -> Rc<NativeBody> {
        Rc::clone(&self.0.body)
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionRef({})", self.0.name)
    }
}

// ============================================================================
// Handle wrappers
// ============================================================================

/// Queue of wrappers that became unreachable and still need finalization
pub(crate) type Graveyard = Rc<RefCell<Vec<(MetaKey, u64)>>>;

struct UserDataBox {
    slot: u64,
    meta: MetaKey,
    graveyard: Weak<RefCell<Vec<(MetaKey, u64)>>>,
}

impl Drop for UserDataBox {
    fn drop(&mut self) {
        if let Some(graveyard) = self.graveyard.upgrade() {
            if let Ok(mut pending) = graveyard.try_borrow_mut() {
                pending.push((self.meta, self.slot));
            }
        }
    }
}

/// Script-side wrapper around an opaque handle slot.
///
/// When the last clone is dropped the slot is queued for finalization; the
/// metatable's `gc` entry runs on the next collection.
#[derive(Clone)]
pub struct UserData(Rc<UserDataBox>);

impl UserData {
    pub(crate) fn new(slot: u64, meta: MetaKey, graveyard: &Graveyard) -> Self {
        UserData(Rc::new(UserDataBox {
            slot,
            meta,
            graveyard: Rc::downgrade(graveyard),
        }))
    }

    /// Raw registry slot this wrapper refers to
    pub fn slot(&self) -> u64 {
        self.0.slot
    }

    /// Metatable of this wrapper
    pub fn meta(&self) -> MetaKey {
        self.0.meta
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &UserData) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(ScriptValue::Nil.tag(), ScriptTag::Nil);
        assert_eq!(ScriptValue::from(true).tag(), ScriptTag::Bool);
        assert_eq!(ScriptValue::from(1.5).tag(), ScriptTag::Number);
        assert_eq!(ScriptValue::from("x").tag(), ScriptTag::String);
        assert_eq!(ScriptValue::LightPointer(8).tag(), ScriptTag::LightPointer);
    }

    #[test]
    fn test_truthiness() {
        assert!(!ScriptValue::Nil.truthy());
        assert!(!ScriptValue::Bool(false).truthy());
        assert!(ScriptValue::Number(0.0).truthy());
        assert!(ScriptValue::string("").truthy());
    }

    #[test]
    fn test_strings_are_raw_bytes() {
        let v = ScriptValue::string([0xffu8, 0x00, 0x41]);
        assert_eq!(v.as_bytes(), Some(&[0xffu8, 0x00, 0x41][..]));
        assert_eq!(v.as_str(), None);
    }

    #[test]
    fn test_userdata_drop_queues_finalization() {
        let graveyard: Graveyard = Rc::new(RefCell::new(Vec::new()));
        let ud = UserData::new(42, 3, &graveyard);
        let alias = ud.clone();
        drop(ud);
        assert!(graveyard.borrow().is_empty());
        drop(alias);
        assert_eq!(graveyard.borrow().as_slice(), &[(3, 42)]);
    }

    #[test]
    fn test_handle_equality_is_identity() {
        let graveyard: Graveyard = Rc::new(RefCell::new(Vec::new()));
        let a = ScriptValue::Handle(UserData::new(1, 0, &graveyard));
        let b = ScriptValue::Handle(UserData::new(1, 0, &graveyard));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
