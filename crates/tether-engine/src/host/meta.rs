//! Reflection metadata
//!
//! Type and member descriptors as the host reports them. Members are kept in
//! declaration order: overload resolution depends on it.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::host::call::Invocation;
use crate::host::il::IlBody;
use crate::host::object::{HostValue, TypeId};
use crate::host::types::{signature, HostType, MethodKind, MethodToken, ParamInfo, TypeKind};

/// Exception thrown by a host method.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HostException {
    /// Exception type name
    pub kind: String,
    /// Exception message
    pub message: String,
}

impl HostException {
    /// Create an exception of the given kind
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// `ArgumentException`
    pub fn argument(message: impl Into<String>) -> Self {
        Self::new("ArgumentException", message)
    }

    /// `NullReferenceException`
    pub fn null_reference(message: impl Into<String>) -> Self {
        Self::new("NullReferenceException", message)
    }

    /// `InvalidProgramException`
    pub fn invalid_program(message: impl Into<String>) -> Self {
        Self::new("InvalidProgramException", message)
    }
}

/// Native method implementation
pub type NativeMethod =
    Arc<dyn Fn(&mut Invocation<'_>) -> Result<HostValue, HostException> + Send + Sync>;

/// How a method executes
#[derive(Clone)]
pub enum MethodBody {
    /// Rust closure
    Native(NativeMethod),
    /// Interpreted host IL
    Il(IlBody),
    /// The runtime patch hub
    PatchHub,
    /// No body; calling it throws
    Abstract,
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Native(_) => f.write_str("Native"),
            MethodBody::Il(body) => write!(f, "Il({} instrs)", body.code.len()),
            MethodBody::PatchHub => f.write_str("PatchHub"),
            MethodBody::Abstract => f.write_str("Abstract"),
        }
    }
}

/// Constructor or method descriptor.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// Runtime identity
    pub token: MethodToken,
    /// Declaring type
    pub declaring: TypeId,
    /// Declaring type name
    pub declaring_name: String,
    /// Member name (`.ctor` for constructors)
    pub name: String,
    /// Constructor, instance, or static
    pub kind: MethodKind,
    /// Declared parameters
    pub params: Vec<ParamInfo>,
    /// Return type (`Void` for constructors)
    pub ret: HostType,
    /// Implementation
    pub body: MethodBody,
}

impl MethodInfo {
    /// Textual signature used for patch registration
    pub fn signature(&self) -> String {
        signature(&self.declaring_name, &self.name, &self.params)
    }

    /// Number of parameters script callers supply (excludes `out`)
    pub fn input_arity(&self) -> usize {
        self.params.iter().filter(|p| p.is_input()).count()
    }

    /// Whether the method produces a return value
    pub fn returns_value(&self) -> bool {
        self.kind != MethodKind::Constructor && !self.ret.is_void()
    }

    /// Whether the method takes an implicit `this`
    pub fn has_this(&self) -> bool {
        self.kind != MethodKind::Static
    }
}

/// Field descriptor
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: HostType,
    /// Object slot for instance fields, static slot otherwise
    pub slot: usize,
    /// Static field
    pub is_static: bool,
}

/// Property descriptor, backed by `get_X`/`set_X` accessor methods
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    /// Property name (`Item` for indexers)
    pub name: String,
    /// Property type
    pub ty: HostType,
    /// Static property
    pub is_static: bool,
    /// `get_X`
    pub getter: Option<Arc<MethodInfo>>,
    /// `set_X`
    pub setter: Option<Arc<MethodInfo>>,
}

/// Name of the indexer property
pub const INDEXER_NAME: &str = "Item";

/// Type descriptor.
#[derive(Debug)]
pub struct TypeInfo {
    /// Identity within the domain
    pub id: TypeId,
    /// Fully qualified name
    pub name: String,
    /// Base type (`None` only for the root)
    pub base: Option<TypeId>,
    /// Class, struct, or array
    pub kind: TypeKind,
    /// Element type of array types
    pub element: Option<HostType>,
    /// Own fields, declaration order
    pub fields: Vec<FieldInfo>,
    /// Own properties, declaration order
    pub properties: Vec<PropertyInfo>,
    /// Constructors, declaration order
    pub constructors: Vec<Arc<MethodInfo>>,
    /// Own methods, declaration order
    pub methods: Vec<Arc<MethodInfo>>,
    /// Number of instance slots including inherited fields
    pub instance_slots: usize,
    pub(crate) layout: Vec<HostType>,
    pub(crate) statics: RefCell<Vec<HostValue>>,
}

impl TypeInfo {
    /// Own field by name
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Own property by name
    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Own methods with the given name, declaration order
    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Arc<MethodInfo>> + 'a {
        self.methods.iter().filter(move |m| m.name == name)
    }

    /// Whether any own method has the given name
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }

    /// Read a static field slot
    pub fn static_value(&self, slot: usize) -> Option<HostValue> {
        self.statics.borrow().get(slot).cloned()
    }

    /// Write a static field slot
    pub fn set_static_value(&self, slot: usize, value: HostValue) -> bool {
        match self.statics.borrow_mut().get_mut(slot) {
            Some(target) => {
                *target = value;
                true
            }
            None => false,
        }
    }

    /// Whether instances are copied when they cross into script
    pub fn is_value_type(&self) -> bool {
        self.kind == TypeKind::Struct
    }

    /// Whether this is an array type
    pub fn is_array(&self) -> bool {
        self.kind == TypeKind::Array
    }
}
