//! Host reflection model
//!
//! The statically typed side of the bridge:
//!
//! - [`types`]: parameter/return type descriptors and signature strings
//! - [`object`]: host objects and reflection-typed values
//! - [`meta`]: type, method, field and property descriptors
//! - [`domain`]: the set of types one VM can see, and builders
//! - [`call`]: method invocation and the patch hub entry
//! - [`il`]: compiled method bodies, interpreter and verifier
//! - [`image`]: serialized images of compiled types

pub mod call;
pub mod domain;
pub mod il;
pub mod image;
pub mod meta;
pub mod object;
pub mod types;

pub use call::{invoke, CallContext, DirectContext, Invocation, PatchRequest};
pub use domain::{DomainError, MethodBuilder, TypeBuilder, TypeDomain, ROOT_TYPE_NAME};
pub use il::{Anchor, IlBody, Instr, VerifyError};
pub use image::{Image, ImageError, MethodAttrs, MethodDef, TypeDef};
pub use meta::{
    FieldInfo, HostException, MethodBody, MethodInfo, PropertyInfo, TypeInfo, INDEXER_NAME,
};
pub use object::{HostObject, HostValue, ObjectRef, TypeId};
pub use types::{
    signature, HostType, MethodKind, MethodToken, NumericKind, ParamInfo, ParamMode, TypeKind,
    CONSTRUCTOR_NAME,
};
