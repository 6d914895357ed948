//! Scoped stack discipline
//!
//! Every component above the VM restores the stack to the depth it found it
//! at, on success and on error. [`StackGuard`] records the depth on creation
//! and truncates back to it when dropped.

use std::ops::{Deref, DerefMut};

use crate::vm::ScriptState;

/// Restores the script stack to its recorded depth on drop.
pub struct StackGuard<'a> {
    state: &'a mut ScriptState,
    depth: usize,
}

impl<'a> StackGuard<'a> {
    /// Record the current depth of `state`
    pub fn new(state: &'a mut ScriptState) -> Self {
        let depth = state.depth();
        Self { state, depth }
    }

    /// Depth the stack will be restored to
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Deref for StackGuard<'_> {
    type Target = ScriptState;

    fn deref(&self) -> &ScriptState {
        self.state
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScriptState {
        self.state
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.state.truncate(self.depth);
    }
}
