//! Hot patching
//!
//! - [`table`]: signature → script function records and the control surface
//!   (`patch`, `unpatch`, `find_patch`)
//! - [`hub`]: runtime side of the patch hub
//! - [`inject`]: editor-time rewrite of compiled images

pub mod hub;
pub mod inject;
pub mod table;

pub use hub::BridgeCallContext;
pub use inject::{inject, inject_body, InjectError, InjectReport};
pub use table::PatchTable;
