//! Tether Engine
//!
//! Script/host interop bridge with runtime hot patching:
//! - **VM**: the embedded script state and its stack API (`vm` module)
//! - **Host**: reflection model, IL bodies and compiled images (`host` module)
//! - **Bridge**: handles, marshaling, dispatch and metatables (`bridge` module)
//! - **Patch**: patch table, hub runtime and the image injector (`patch` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use tether_engine::{inject, Image, ScriptRuntime, TypeDomain};
//!
//! // Editor time: rewrite patchable methods
//! let (image, report) = inject(&Image::read("game.timg")?)?;
//!
//! // Runtime: load the image and route a method to a script function
//! let mut runtime = ScriptRuntime::new(Rc::new(TypeDomain::new()));
//! runtime.load_image(&image)?;
//! runtime.bridge().patch(&report.injected[0], patch_fn);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Interop bridge: handles, marshaling, dispatch, metatables
pub mod bridge;

/// Bridge configuration
pub mod config;

/// Error types
pub mod error;

/// Host reflection model, IL and images
pub mod host;

/// Hot patching: patch table, hub runtime, injector
pub mod patch;

/// VM, bridge and task queue bundled per owner thread
pub mod runtime;

/// Embedded script VM
pub mod vm;

// ============================================================================
// Re-exports
// ============================================================================

pub use bridge::{Bridge, CallShape, MethodCache, ObjectHandle, Ownership, TaskError, TaskSender};
pub use config::{BridgeOptions, ConfigError};
pub use error::{BridgeError, BridgeResult, ScriptError};
pub use host::{HostType, HostValue, Image, ImageError, MethodDef, ObjectRef, TypeDef, TypeDomain, TypeId};
pub use patch::{inject, InjectError, InjectReport};
pub use runtime::{ScriptRuntime, TickStats};
pub use vm::{FunctionRef, ScriptState, ScriptValue};
