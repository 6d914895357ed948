//! Subcommand implementations

pub mod inject;
pub mod signatures;
pub mod verify;
