//! Compiled chunk blobs
//!
//! A dumped function is an opaque byte blob. The bridge never looks inside;
//! it only passes blobs between `dump` and `load`.
//!
//! # Format
//!
//! ```text
//! ┌──────────┬─────────┬──────────────┬────────────┬────────────┐
//! │ magic(4) │ ver(1)  │ name_len(4)  │ name bytes │ crc32(4)   │
//! └──────────┴─────────┴──────────────┴────────────┴────────────┘
//! ```
//!
//! Integers are little-endian. The checksum covers everything before it.

use std::rc::Rc;

use crate::error::ScriptError;
use crate::vm::value::FunctionRef;
use crate::vm::ScriptState;

/// Chunk magic bytes
pub const CHUNK_MAGIC: [u8; 4] = *b"\x1bTCH";

/// Chunk format version
pub const CHUNK_VERSION: u8 = 1;

impl ScriptState {
    /// Define a named prototype that functions can be loaded from
    pub fn define_prototype(
        &mut self,
        name: &str,
        body: impl Fn(&mut ScriptState) -> Result<usize, ScriptError> + 'static,
    ) {
        self.prototypes.insert(name.to_string(), Rc::new(body));
    }

    /// Instantiate a function from a defined prototype
    pub fn load_prototype(&self, name: &str) -> Result<FunctionRef, ScriptError> {
        let body = self
            .prototypes
            .get(name)
            .ok_or_else(|| ScriptError::new(format!("unknown prototype '{}'", name)))?;
        Ok(FunctionRef::from_prototype(name, Rc::clone(body)))
    }

    /// Dump a function into an opaque blob
    pub fn dump(&self, func: &FunctionRef) -> Result<Vec<u8>, ScriptError> {
        let name = func
            .prototype()
            .ok_or_else(|| ScriptError::new(format!("unable to dump function '{}'", func.name())))?;
        let mut out = Vec::with_capacity(13 + name.len());
        out.extend_from_slice(&CHUNK_MAGIC);
        out.push(CHUNK_VERSION);
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Load a function from a blob produced by [`dump`](Self::dump)
    pub fn load(&self, blob: &[u8], chunk_name: &str) -> Result<FunctionRef, ScriptError> {
        let bad = |what: &str| ScriptError::new(format!("{}: {}", chunk_name, what));
        if blob.len() < 13 || blob[..4] != CHUNK_MAGIC {
            return Err(bad("not a precompiled chunk"));
        }
        if blob[4] != CHUNK_VERSION {
            return Err(bad("version mismatch"));
        }
        let (body, crc_bytes) = blob.split_at(blob.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(crc_bytes);
        if crc32fast::hash(body) != u32::from_le_bytes(crc) {
            return Err(bad("checksum mismatch"));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&body[5..9]);
        let len = u32::from_le_bytes(len) as usize;
        if body.len() != 9 + len {
            return Err(bad("truncated chunk"));
        }
        let name = std::str::from_utf8(&body[9..]).map_err(|_| bad("malformed prototype name"))?;
        self.load_prototype(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ScriptValue;

    fn state_with_proto() -> ScriptState {
        let mut vm = ScriptState::new();
        vm.define_prototype("answer", |vm| {
            vm.push(42.0);
            Ok(1)
        });
        vm
    }

    #[test]
    fn test_dump_then_load_runs_same_body() {
        let vm = state_with_proto();
        let func = vm.load_prototype("answer").unwrap();
        let blob = vm.dump(&func).unwrap();

        let mut other = state_with_proto();
        let loaded = other.load(&blob, "=answer").unwrap();
        let results = other.call_value(&ScriptValue::Function(loaded), &[]).unwrap();
        assert_eq!(results, vec![ScriptValue::Number(42.0)]);
    }

    #[test]
    fn test_plain_functions_cannot_be_dumped() {
        let vm = ScriptState::new();
        let func = FunctionRef::new("anon", |_| Ok(0));
        assert!(vm.dump(&func).is_err());
    }

    #[test]
    fn test_corrupted_blob_is_rejected() {
        let vm = state_with_proto();
        let func = vm.load_prototype("answer").unwrap();
        let mut blob = vm.dump(&func).unwrap();
        blob[10] ^= 0xff;
        let err = vm.load(&blob, "=answer").unwrap_err();
        assert!(err.message.contains("checksum mismatch"));
        assert!(vm.load(b"junk", "=junk").is_err());
    }
}
