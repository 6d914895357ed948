//! Interop bridge
//!
//! Everything between the script VM and the host reflection model:
//!
//! - [`registry`]: generational handles for host objects
//! - [`marshal`]: value conversion in both directions
//! - [`dispatch`]: overload resolution and the method cache
//! - [`metatable`]: per-type metatables, `import`, member access
//! - [`owner`]: owner-thread assertion and the bounded task queue
//!
//! A [`Bridge`] serves exactly one VM instance. Metatable keys, class handles
//! and method wrappers it creates are only meaningful in that VM.

pub mod dispatch;
pub mod marshal;
pub mod metatable;
pub mod owner;
pub mod registry;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;

use crate::config::BridgeOptions;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{ObjectRef, TypeDomain, TypeId, CONSTRUCTOR_NAME};
use crate::patch::PatchTable;
use crate::vm::{FunctionRef, ScriptState, ScriptTag, ScriptValue};

pub use dispatch::{CallShape, MethodCache, MethodKey};
pub use marshal::tag_accepts;
pub use metatable::{Registration, TypeMetatables};
pub use owner::{OwnerThread, Task, TaskError, TaskQueue, TaskSender};
pub use registry::{HandleRegistry, ObjectHandle, Ownership, Resolved};

/// The interop bridge of one VM instance.
///
/// Owns the handle registry, method cache, type registrations and patch
/// table. All of it is created with the bridge, dropped with it, and never
/// shared with another VM.
pub struct Bridge {
    pub(crate) this: Weak<Bridge>,
    options: BridgeOptions,
    pub(crate) owner: OwnerThread,
    pub(crate) domain: Rc<TypeDomain>,
    pub(crate) registry: RefCell<HandleRegistry>,
    pub(crate) cache: MethodCache,
    pub(crate) exposed: RefCell<FxHashMap<TypeId, Registration>>,
    pub(crate) classes: RefCell<FxHashMap<TypeId, ScriptValue>>,
    pub(crate) wrappers: RefCell<FxHashMap<(TypeId, String), FunctionRef>>,
    pub(crate) patches: RefCell<PatchTable>,
}

impl Bridge {
    /// Bridge over `domain`, owned by the calling thread
    pub fn new(domain: Rc<TypeDomain>, options: BridgeOptions) -> Rc<Bridge> {
        Self::with_owner(domain, options, OwnerThread::current())
    }

    pub(crate) fn with_owner(domain: Rc<TypeDomain>, options: BridgeOptions, owner: OwnerThread) -> Rc<Bridge> {
        Rc::new_cyclic(|this| Bridge {
            this: this.clone(),
            options,
            owner,
            domain,
            registry: RefCell::new(HandleRegistry::new()),
            cache: MethodCache::new(),
            exposed: RefCell::new(FxHashMap::default()),
            classes: RefCell::new(FxHashMap::default()),
            wrappers: RefCell::new(FxHashMap::default()),
            patches: RefCell::new(PatchTable::new()),
        })
    }

    /// Host types visible through this bridge
    pub fn domain(&self) -> &TypeDomain {
        &self.domain
    }

    /// Limits this bridge was created with
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Method cache
    pub fn cache(&self) -> &MethodCache {
        &self.cache
    }

    /// Drop every cached resolution (script hot reload)
    pub fn clear_method_cache(&self) {
        self.owner.assert_owner();
        self.cache.clear();
        log::debug!("method cache cleared");
    }

    /// Number of live handles, class handles included
    pub fn handle_count(&self) -> usize {
        self.registry.borrow().len()
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Register an object, returning a new handle
    pub fn wrap(&self, obj: &ObjectRef, ownership: Ownership) -> ObjectHandle {
        self.owner.assert_owner();
        self.registry.borrow_mut().wrap(obj, ownership)
    }

    /// Object behind a handle
    pub fn unwrap(&self, handle: ObjectHandle) -> BridgeResult<ObjectRef> {
        self.owner.assert_owner();
        self.registry.borrow().unwrap(handle)
    }

    /// Retire a handle. At most once per [`wrap`](Self::wrap).
    pub fn release(&self, handle: ObjectHandle) -> BridgeResult<()> {
        self.owner.assert_owner();
        self.registry.borrow_mut().release(handle)
    }

    /// Call `member` on whatever `handle` refers to.
    ///
    /// Object handles make instance calls; class handles make static calls,
    /// or construct when `member` is `.ctor`.
    pub fn call(
        &self,
        vm: &mut ScriptState,
        handle: ObjectHandle,
        member: &str,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        self.owner.assert_owner();
        let resolved = self.registry.borrow().resolve(handle)?;
        match resolved {
            Resolved::Object(obj) => self.call_member(vm, obj.type_id(), member, CallShape::Instance, Some(obj), args),
            Resolved::Class(ty) if member == CONSTRUCTOR_NAME => {
                self.call_member(vm, ty, member, CallShape::Constructor, None, args)
            }
            Resolved::Class(ty) => self.call_member(vm, ty, member, CallShape::Static, None, args),
        }
    }

    // ========================================================================
    // Script globals
    // ========================================================================

    /// Script function running `body` against this bridge.
    ///
    /// Arguments are the callee's frame; returned values become its results.
    pub(crate) fn bridge_fn<F>(&self, name: &str, body: F) -> FunctionRef
    where
        F: Fn(&Bridge, &mut ScriptState, &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> + 'static,
    {
        let weak = self.this.clone();
        let finalizer = name == "__gc";
        FunctionRef::new(name, move |vm| {
            let bridge = match weak.upgrade() {
                Some(bridge) => bridge,
                // Handles die with the bridge; nothing left to release
                None if finalizer => return Ok(0),
                None => return Err(vm.error("bridge was dropped")),
            };
            let args = vm.frame_values();
            let results = body(&bridge, vm, &args)?;
            let count = results.len();
            for value in results {
                vm.push(value);
            }
            Ok(count)
        })
    }

    /// Install `import`, `patch`, `unpatch` and `find_patch` as globals
    pub fn install(&self, vm: &mut ScriptState) {
        self.owner.assert_owner();
        let import = self.bridge_fn("import", |bridge, vm, args| {
            let name = string_arg(args, 0, "import")?;
            Ok(vec![bridge.import(vm, &name)?])
        });
        let patch = self.bridge_fn("patch", |bridge, _, args| {
            let signature = string_arg(args, 0, "patch")?;
            match args.get(1) {
                Some(ScriptValue::Function(func)) => {
                    bridge.patch(&signature, func.clone());
                    Ok(Vec::new())
                }
                other => Err(BridgeError::conversion(
                    "function",
                    other.map(|v| v.tag()).unwrap_or(ScriptTag::Nil).name(),
                )),
            }
        });
        let unpatch = self.bridge_fn("unpatch", |bridge, _, args| {
            let signature = string_arg(args, 0, "unpatch")?;
            Ok(vec![ScriptValue::Bool(bridge.unpatch(&signature))])
        });
        let find_patch = self.bridge_fn("find_patch", |bridge, _, args| {
            let signature = string_arg(args, 0, "find_patch")?;
            Ok(vec![bridge
                .find_patch(&signature)
                .map(ScriptValue::Function)
                .unwrap_or_default()])
        });
        vm.set_global("import", import);
        vm.set_global("patch", patch);
        vm.set_global("unpatch", unpatch);
        vm.set_global("find_patch", find_patch);
    }
}

fn string_arg(args: &[ScriptValue], index: usize, func: &str) -> BridgeResult<String> {
    match args.get(index) {
        Some(ScriptValue::String(bytes)) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        other => Err(BridgeError::conversion(
            format!("string (argument #{} to '{}')", index + 1, func),
            other.map(|v| v.tag()).unwrap_or(ScriptTag::Nil).name(),
        )),
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("registry", &self.registry.borrow())
            .field("cache", &self.cache)
            .field("registered", &self.exposed.borrow().len())
            .field("patches", &self.patches.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostType, HostValue, MethodBuilder, TypeBuilder};

    fn fixture() -> (ScriptState, Rc<Bridge>) {
        let domain = TypeDomain::new();
        domain
            .define(
                TypeBuilder::class("Game.Box")
                    .field("size", HostType::i32())
                    .method(MethodBuilder::constructor())
                    .method(
                        MethodBuilder::method("Grow")
                            .param("by", HostType::i32())
                            .returns(HostType::i32())
                            .native(|inv| {
                                let by = inv.arg_i64(0)?;
                                let this = inv.this()?;
                                let size = this.get(0).and_then(|v| v.as_i64()).unwrap_or(0) + by;
                                this.set(0, HostValue::Int(size));
                                Ok(HostValue::Int(size))
                            }),
                    ),
            )
            .unwrap();
        let mut vm = ScriptState::new();
        let bridge = Bridge::new(Rc::new(domain), BridgeOptions::default());
        bridge.install(&mut vm);
        (vm, bridge)
    }

    #[test]
    fn test_host_call_through_handle() {
        let (mut vm, bridge) = fixture();
        let ty = bridge.domain().lookup("Game.Box").unwrap();
        let obj = bridge.domain().instantiate(ty).unwrap();
        let handle = bridge.wrap(&obj, Ownership::Strong);
        let results = bridge.call(&mut vm, handle, "Grow", &[ScriptValue::Number(3.0)]).unwrap();
        assert_eq!(results, vec![ScriptValue::Number(3.0)]);
        assert_eq!(obj.get(0), Some(HostValue::Int(3)));

        bridge.release(handle).unwrap();
        assert!(matches!(bridge.unwrap(handle), Err(BridgeError::StaleHandle(_))));
        assert!(matches!(
            bridge.call(&mut vm, handle, "Grow", &[ScriptValue::Number(1.0)]),
            Err(BridgeError::StaleHandle(_))
        ));
    }

    #[test]
    fn test_import_global() {
        let (mut vm, _bridge) = fixture();
        let import = vm.get_global("import");
        let class = vm.call_value(&import, &["Game.Box".into()]).unwrap().remove(0);
        assert_eq!(vm.to_display(&class).unwrap(), "class Game.Box");

        let err = vm.call_value(&import, &["Game.Missing".into()]).unwrap_err();
        assert_eq!(err.message, "Type `Game.Missing` not found");
        assert!(err.traceback.contains("import"));

        let err = vm.call_value(&import, &[ScriptValue::Number(1.0)]).unwrap_err();
        assert!(err.message.contains("argument #1 to 'import'"), "{}", err.message);
    }

    #[test]
    fn test_patch_globals() {
        let (mut vm, bridge) = fixture();
        let func = FunctionRef::new("p", |_| Ok(0));
        let patch = vm.get_global("patch");
        let find = vm.get_global("find_patch");
        let unpatch = vm.get_global("unpatch");

        vm.call_value(&patch, &["Game.Box::Grow(Int32)".into(), func.clone().into()])
            .unwrap();
        assert!(bridge.find_patch("Game.Box::Grow(Int32)").unwrap().ptr_eq(&func));
        let found = vm.call_value(&find, &["Game.Box::Grow(Int32)".into()]).unwrap();
        assert_eq!(found, vec![ScriptValue::Function(func)]);

        assert_eq!(
            vm.call_value(&unpatch, &["Game.Box::Grow(Int32)".into()]).unwrap(),
            vec![ScriptValue::Bool(true)]
        );
        assert_eq!(
            vm.call_value(&find, &["Game.Box::Grow(Int32)".into()]).unwrap(),
            vec![ScriptValue::Nil]
        );
        assert!(vm.call_value(&patch, &["x".into(), ScriptValue::Number(1.0)]).is_err());
    }

    #[test]
    fn test_dropped_bridge_raises() {
        let (mut vm, bridge) = fixture();
        let import = vm.get_global("import");
        drop(bridge);
        let err = vm.call_value(&import, &["Game.Box".into()]).unwrap_err();
        assert_eq!(err.message, "bridge was dropped");
    }
}
