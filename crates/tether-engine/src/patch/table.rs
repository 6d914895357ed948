//! Patch records
//!
//! Signature string → script function. At most one patch per signature; a
//! second `patch` for the same signature replaces the first.

use rustc_hash::FxHashMap;

use crate::bridge::Bridge;
use crate::vm::FunctionRef;

/// Active patches keyed by method signature
#[derive(Debug, Default)]
pub struct PatchTable {
    records: FxHashMap<String, FunctionRef>,
}

impl PatchTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a patch, returning the one it replaced
    pub fn patch(&mut self, signature: impl Into<String>, func: FunctionRef) -> Option<FunctionRef> {
        self.records.insert(signature.into(), func)
    }

    /// Remove a patch
    pub fn remove(&mut self, signature: &str) -> Option<FunctionRef> {
        self.records.remove(signature)
    }

    /// Patch for a signature
    pub fn find(&self, signature: &str) -> Option<&FunctionRef> {
        self.records.get(signature)
    }

    /// Patched signatures, sorted
    pub fn signatures(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.records.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    /// Remove every patch
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of active patches
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no patch is active
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Bridge {
    /// Route calls of the method with `signature` through `func`
    pub fn patch(&self, signature: &str, func: FunctionRef) {
        self.owner.assert_owner();
        if self.patches.borrow_mut().patch(signature, func).is_some() {
            log::debug!("replaced patch for {}", signature);
        } else {
            log::debug!("patched {}", signature);
        }
    }

    /// Remove the patch for `signature`; returns whether one was active
    pub fn unpatch(&self, signature: &str) -> bool {
        self.owner.assert_owner();
        let removed = self.patches.borrow_mut().remove(signature).is_some();
        if removed {
            log::debug!("unpatched {}", signature);
        }
        removed
    }

    /// The active patch for `signature`
    pub fn find_patch(&self, signature: &str) -> Option<FunctionRef> {
        self.owner.assert_owner();
        self.patches.borrow().find(signature).cloned()
    }

    /// Signatures with an active patch, sorted
    pub fn patched_signatures(&self) -> Vec<String> {
        self.patches.borrow().signatures().into_iter().map(str::to_string).collect()
    }
}
