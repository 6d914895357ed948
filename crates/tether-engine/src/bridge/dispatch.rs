//! Reflective dispatcher
//!
//! Resolves `(type, member, call shape, argument tags)` to a concrete
//! constructor or method and caches the answer.
//!
//! Resolution walks the type and then its bases, visiting members in
//! declaration order, and takes the first candidate whose input arity and
//! per-argument tags fit. Overloads that both fit are not ranked: the first
//! declared one wins, every time.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::bridge::marshal::tag_accepts;
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{self, MethodInfo, MethodKind, ObjectRef, TypeId};
use crate::patch::BridgeCallContext;
use crate::vm::{ScriptState, ScriptTag, ScriptValue};

/// How script code invoked a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// `Class(args...)`
    Constructor,
    /// `Class.Method(args...)` or `obj.Method(args...)`
    Static,
    /// `obj:Method(args...)`
    Instance,
}

impl CallShape {
    fn accepts(self, kind: MethodKind) -> bool {
        matches!(
            (self, kind),
            (CallShape::Constructor, MethodKind::Constructor)
                | (CallShape::Static, MethodKind::Static)
                | (CallShape::Instance, MethodKind::Instance)
        )
    }

    fn code(self) -> char {
        match self {
            CallShape::Constructor => 'c',
            CallShape::Static => 's',
            CallShape::Instance => 'i',
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallShape::Constructor => "constructor",
            CallShape::Static => "static",
            CallShape::Instance => "instance",
        })
    }
}

/// Cache key of one call site shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Type the lookup starts on
    pub declaring: String,
    /// Member name
    pub member: String,
    /// Call shape
    pub shape: CallShape,
    /// Argument tags, in order
    pub tags: Vec<ScriptTag>,
}

impl MethodKey {
    /// Canonical string form: `Type::Member#s(number,string)`
    pub fn mangle(&self) -> String {
        let mut out = format!("{}::{}#{}(", self.declaring, self.member, self.shape.code());
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(tag.name());
        }
        out.push(')');
        out
    }
}

/// Resolved members keyed by mangled [`MethodKey`].
///
/// Entries are never overwritten. The population counter increments once
/// per distinct key until the next [`MethodCache::clear`].
#[derive(Default)]
pub struct MethodCache {
    entries: Mutex<FxHashMap<String, Arc<MethodInfo>>>,
    population: AtomicUsize,
    hits: AtomicUsize,
}

impl MethodCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached resolution for `key`
    pub fn get(&self, key: &str) -> Option<Arc<MethodInfo>> {
        let hit = self.entries.lock().get(key).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Record a resolution. Inserting an existing key is a programming error.
    pub fn insert(&self, key: String, method: Arc<MethodInfo>) {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            debug_assert!(false, "method cache key inserted twice: {}", key);
            log::warn!("method cache key inserted twice: {}", key);
            return;
        }
        entries.insert(key, method);
        self.population.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every entry and reset the counters
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.population.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
    }

    /// Number of entries inserted since the last clear
    pub fn population(&self) -> usize {
        self.population.load(Ordering::Relaxed)
    }

    /// Number of lookups served from the cache
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of current entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MethodCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCache")
            .field("len", &self.len())
            .field("population", &self.population())
            .field("hits", &self.hits())
            .finish()
    }
}

fn matches_tags(method: &MethodInfo, tags: &[ScriptTag]) -> bool {
    method.input_arity() == tags.len()
        && method
            .params
            .iter()
            .filter(|p| p.is_input())
            .zip(tags)
            .all(|(p, tag)| tag_accepts(*tag, &p.ty))
}

impl Bridge {
    /// Resolve a member for a call shape and argument tags
    pub fn resolve(
        &self,
        ty: TypeId,
        member: &str,
        shape: CallShape,
        tags: &[ScriptTag],
    ) -> BridgeResult<Arc<MethodInfo>> {
        self.owner.assert_owner();
        let info = self
            .domain
            .get(ty)
            .ok_or_else(|| BridgeError::TypeNotFound(format!("#{}", ty.0)))?;
        let key = MethodKey {
            declaring: info.name.clone(),
            member: member.to_string(),
            shape,
            tags: tags.to_vec(),
        }
        .mangle();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let candidates: Vec<Arc<MethodInfo>> = if shape == CallShape::Constructor {
            info.constructors.clone()
        } else {
            self.domain
                .chain(ty)
                .iter()
                .flat_map(|t| t.methods_named(member).cloned().collect::<Vec<_>>())
                .collect()
        };

        let mut wrong_shape = None;
        for candidate in candidates {
            if !matches_tags(&candidate, tags) {
                continue;
            }
            if shape.accepts(candidate.kind) {
                log::debug!("method cache miss: {} -> {}", key, candidate.signature());
                self.cache.insert(key, Arc::clone(&candidate));
                return Ok(candidate);
            }
            wrong_shape.get_or_insert(candidate);
        }

        match wrong_shape {
            Some(candidate) => Err(BridgeError::AmbiguousStaticVsInstanceCall {
                type_name: info.name.clone(),
                member: member.to_string(),
                expected: if candidate.kind == MethodKind::Static {
                    "a static"
                } else {
                    "an instance"
                },
            }),
            None => Err(BridgeError::NoMatchingMember {
                type_name: info.name.clone(),
                member: member.to_string(),
                shape: tags.iter().map(|t| t.name()).collect::<Vec<_>>().join(", "),
            }),
        }
    }

    /// Marshal `args`, run `method`, and marshal its results back.
    ///
    /// Host exceptions come back as [`BridgeError::Host`] carrying the
    /// original message.
    pub fn invoke_method(
        &self,
        vm: &mut ScriptState,
        method: &MethodInfo,
        this: Option<ObjectRef>,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        self.owner.assert_owner();
        let mut host_args = self.marshal_args(method, args)?;
        let ret = {
            let mut ctx = BridgeCallContext::new(vm, self);
            host::invoke(method, this, &mut host_args, &mut ctx)
        };
        let ret = ret.map_err(|err| {
            log::debug!("{} threw {}", method.signature(), err);
            BridgeError::Host(err)
        })?;
        self.marshal_results(vm, method, &ret, &host_args)
    }

    /// Resolve and invoke in one step
    pub fn call_member(
        &self,
        vm: &mut ScriptState,
        ty: TypeId,
        member: &str,
        shape: CallShape,
        this: Option<ObjectRef>,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        self.owner.assert_owner();
        let tags: Vec<ScriptTag> = args.iter().map(ScriptValue::tag).collect();
        let method = self.resolve(ty, member, shape, &tags)?;
        self.invoke_method(vm, &method, this, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::OwnerThread;
    use crate::config::BridgeOptions;
    use crate::host::{HostType, HostValue, MethodBuilder, TypeBuilder, TypeDomain};
    use std::rc::Rc;

    fn bridge() -> (Rc<Bridge>, TypeId) {
        let domain = TypeDomain::new();
        let ty = domain
            .define(
                TypeBuilder::class("Game.Printer")
                    .method(MethodBuilder::constructor())
                    .method(
                        MethodBuilder::method("Show")
                            .param("n", HostType::i32())
                            .returns(HostType::String)
                            .native(|_| Ok(HostValue::str("int"))),
                    )
                    .method(
                        MethodBuilder::method("Show")
                            .param("s", HostType::String)
                            .returns(HostType::String)
                            .native(|_| Ok(HostValue::str("string"))),
                    )
                    .method(
                        MethodBuilder::method("Make")
                            .static_()
                            .returns(HostType::i32())
                            .native(|_| Ok(HostValue::Int(1))),
                    ),
            )
            .unwrap();
        (Bridge::new(Rc::new(domain), BridgeOptions::default()), ty)
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "VM accessed from")]
    fn test_resolve_asserts_owner_thread() {
        let (owned, ty) = bridge();
        let foreign = std::thread::spawn(OwnerThread::current).join().unwrap();
        let bridge = Bridge::with_owner(Rc::clone(&owned.domain), BridgeOptions::default(), foreign);
        let _ = bridge.resolve(ty, "Make", CallShape::Static, &[]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "VM accessed from")]
    fn test_marshal_asserts_owner_thread() {
        let (owned, _) = bridge();
        let foreign = std::thread::spawn(OwnerThread::current).join().unwrap();
        let bridge = Bridge::with_owner(Rc::clone(&owned.domain), BridgeOptions::default(), foreign);
        let _ = bridge.to_host(&ScriptValue::Number(1.0), &HostType::i32());
    }

    #[test]
    fn test_overload_selected_by_tag() {
        let (bridge, ty) = bridge();
        let by_number = bridge.resolve(ty, "Show", CallShape::Instance, &[ScriptTag::Number]).unwrap();
        let by_string = bridge.resolve(ty, "Show", CallShape::Instance, &[ScriptTag::String]).unwrap();
        assert_eq!(by_number.params[0].ty, HostType::i32());
        assert_eq!(by_string.params[0].ty, HostType::String);
        assert_eq!(bridge.cache().population(), 2);
    }

    #[test]
    fn test_repeat_resolution_hits_cache() {
        let (bridge, ty) = bridge();
        for _ in 0..5 {
            bridge.resolve(ty, "Show", CallShape::Instance, &[ScriptTag::Number]).unwrap();
        }
        assert_eq!(bridge.cache().population(), 1);
        assert_eq!(bridge.cache().hits(), 4);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let (bridge, ty) = bridge();
        let err = bridge
            .resolve(ty, "Show", CallShape::Instance, &[ScriptTag::Bool])
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoMatchingMember { .. }));
        let err = bridge.resolve(ty, "Make", CallShape::Instance, &[]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::AmbiguousStaticVsInstanceCall { expected: "a static", .. }
        ));
        let err = bridge
            .resolve(ty, "Show", CallShape::Static, &[ScriptTag::Number])
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::AmbiguousStaticVsInstanceCall { expected: "an instance", .. }
        ));
        assert_eq!(bridge.cache().population(), 0);
    }

    #[test]
    fn test_mangle() {
        let key = MethodKey {
            declaring: "A.B".into(),
            member: "Go".into(),
            shape: CallShape::Static,
            tags: vec![ScriptTag::Number, ScriptTag::Handle],
        };
        assert_eq!(key.mangle(), "A.B::Go#s(number,handle)");
    }

    #[test]
    fn test_clear_resets_counters() {
        let (bridge, ty) = bridge();
        bridge.resolve(ty, "Make", CallShape::Static, &[]).unwrap();
        bridge.resolve(ty, "Make", CallShape::Static, &[]).unwrap();
        assert_eq!(bridge.cache().hits(), 1);
        bridge.clear_method_cache();
        assert!(bridge.cache().is_empty());
        assert_eq!(bridge.cache().population(), 0);
        assert_eq!(bridge.cache().hits(), 0);
        bridge.resolve(ty, "Make", CallShape::Static, &[]).unwrap();
        assert_eq!(bridge.cache().population(), 1);
    }
}
