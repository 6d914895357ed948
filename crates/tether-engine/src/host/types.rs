//! Host type descriptors
//!
//! Parameter, field, and return types as reported by the host's metadata.
//! Named class/struct types are referenced by their fully qualified name so
//! descriptors stay serializable inside compiled images.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric primitive kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericKind {
    /// 8-bit signed
    I8,
    /// 16-bit signed
    I16,
    /// 32-bit signed
    I32,
    /// 64-bit signed
    I64,
    /// 8-bit unsigned
    U8,
    /// 16-bit unsigned
    U16,
    /// 32-bit unsigned
    U32,
    /// 64-bit unsigned
    U64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl NumericKind {
    /// Metadata name of the kind
    pub fn name(self) -> &'static str {
        match self {
            NumericKind::I8 => "SByte",
            NumericKind::I16 => "Int16",
            NumericKind::I32 => "Int32",
            NumericKind::I64 => "Int64",
            NumericKind::U8 => "Byte",
            NumericKind::U16 => "UInt16",
            NumericKind::U32 => "UInt32",
            NumericKind::U64 => "UInt64",
            NumericKind::F32 => "Single",
            NumericKind::F64 => "Double",
        }
    }

    /// Whether values of this kind are integral
    pub fn is_integer(self) -> bool {
        !matches!(self, NumericKind::F32 | NumericKind::F64)
    }

    /// Whether values of this kind are unsigned integers
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            NumericKind::U8 | NumericKind::U16 | NumericKind::U32 | NumericKind::U64
        )
    }

    /// Inclusive lower bound and exclusive upper bound, as doubles
    pub(crate) fn bounds(self) -> (f64, f64) {
        match self {
            NumericKind::I8 => (-128.0, 128.0),
            NumericKind::I16 => (-32768.0, 32768.0),
            NumericKind::I32 => (-2147483648.0, 2147483648.0),
            NumericKind::I64 => (-9.223372036854776e18, 9.223372036854776e18),
            NumericKind::U8 => (0.0, 256.0),
            NumericKind::U16 => (0.0, 65536.0),
            NumericKind::U32 => (0.0, 4294967296.0),
            NumericKind::U64 => (0.0, 1.8446744073709552e19),
            NumericKind::F32 => (f32::MIN as f64, f32::MAX as f64),
            NumericKind::F64 => (f64::MIN, f64::MAX),
        }
    }
}

/// Type of a host parameter, field, or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostType {
    /// No value (return type only)
    Void,
    /// Boolean
    Bool,
    /// Numeric primitive
    Numeric(NumericKind),
    /// Byte string
    String,
    /// Pointer-sized integer handle
    Pointer,
    /// Root object type; accepts anything
    Object,
    /// Named class or struct type
    Class(String),
    /// Array with the given element type
    Array(Box<HostType>),
}

impl HostType {
    /// `Int32`
    pub fn i32() -> Self {
        HostType::Numeric(NumericKind::I32)
    }

    /// `Int64`
    pub fn i64() -> Self {
        HostType::Numeric(NumericKind::I64)
    }

    /// `Double`
    pub fn f64() -> Self {
        HostType::Numeric(NumericKind::F64)
    }

    /// Named class or struct type
    pub fn class(name: impl Into<String>) -> Self {
        HostType::Class(name.into())
    }

    /// Array of `elem`
    pub fn array(elem: HostType) -> Self {
        HostType::Array(Box::new(elem))
    }

    /// Whether this is `Void`
    pub fn is_void(&self) -> bool {
        matches!(self, HostType::Void)
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Void => f.write_str("Void"),
            HostType::Bool => f.write_str("Boolean"),
            HostType::Numeric(kind) => f.write_str(kind.name()),
            HostType::String => f.write_str("String"),
            HostType::Pointer => f.write_str("IntPtr"),
            HostType::Object => f.write_str("System.Object"),
            HostType::Class(name) => f.write_str(name),
            HostType::Array(elem) => write!(f, "{}[]", elem),
        }
    }
}

/// How a parameter is passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParamMode {
    /// By value
    #[default]
    In,
    /// By reference, read and written
    Ref,
    /// By reference, written only
    Out,
}

/// Declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamInfo {
    /// Parameter name
    pub name: String,
    /// Parameter type
    pub ty: HostType,
    /// Passing mode
    #[serde(default)]
    pub mode: ParamMode,
}

impl ParamInfo {
    /// By-value parameter
    pub fn new(name: impl Into<String>, ty: HostType) -> Self {
        Self {
            name: name.into(),
            ty,
            mode: ParamMode::In,
        }
    }

    /// Parameter with an explicit passing mode
    pub fn with_mode(name: impl Into<String>, ty: HostType, mode: ParamMode) -> Self {
        Self {
            name: name.into(),
            ty,
            mode,
        }
    }

    /// Whether script callers supply this parameter
    pub fn is_input(&self) -> bool {
        self.mode != ParamMode::Out
    }

    /// Whether the callee writes this parameter back
    pub fn is_by_ref(&self) -> bool {
        self.mode != ParamMode::In
    }
}

/// Kind of method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// Instance constructor
    Constructor,
    /// Instance method
    Instance,
    /// Static method
    Static,
}

/// Kind of type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TypeKind {
    /// Reference type
    #[default]
    Class,
    /// Value type; copied when it crosses into script
    Struct,
    /// Array type
    Array,
}

/// Runtime identity of a method inside a domain or image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodToken(pub u32);

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Name used for constructors in signatures
pub const CONSTRUCTOR_NAME: &str = ".ctor";

/// Textual signature: `Declaring.Type::Name(T1,ref T2,out T3)`
pub fn signature(declaring: &str, name: &str, params: &[ParamInfo]) -> String {
    let mut out = String::with_capacity(declaring.len() + name.len() + 16);
    out.push_str(declaring);
    out.push_str("::");
    out.push_str(name);
    out.push('(');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match param.mode {
            ParamMode::In => {}
            ParamMode::Ref => out.push_str("ref "),
            ParamMode::Out => out.push_str("out "),
        }
        out.push_str(&param.ty.to_string());
    }
    out.push(')');
    out
}
