//! Embedded script VM and its stack adapter
//!
//! - [`ScriptState`]: value stack, call frames, globals, metatables
//! - [`ScriptValue`]: the tagged union crossing the boundary
//! - [`StackGuard`]: scoped restore of stack depth
//! - chunk dump/load of opaque function blobs

pub mod chunk;
pub mod stack;
pub mod state;
pub mod value;

pub use stack::StackGuard;
pub use state::{Metatable, ScriptState, MULTRET};
pub use value::{FunctionRef, MetaKey, NativeBody, ScriptFunction, ScriptTag, ScriptValue, UserData};
