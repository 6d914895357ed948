//! Script runtime: one VM, its bridge and its owner-thread task queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use tether_engine::{ScriptRuntime, TypeDomain};
//!
//! let mut runtime = ScriptRuntime::new(Rc::new(TypeDomain::new()));
//! let sender = runtime.sender();
//! std::thread::spawn(move || {
//!     sender.post(|vm, _| { vm.set_global("ready", true); Ok(()) }).ok();
//! });
//! runtime.tick();
//! ```

use std::rc::Rc;

use crate::bridge::{Bridge, ObjectHandle, TaskQueue, TaskSender};
use crate::config::BridgeOptions;
use crate::error::{BridgeResult, ScriptError};
use crate::host::{Image, ImageError, TypeDomain, TypeId};
use crate::vm::{FunctionRef, ScriptState, ScriptValue};

/// What one [`ScriptRuntime::tick`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Tasks drained from the queue
    pub tasks: usize,
    /// Handle wrappers finalized
    pub finalized: usize,
}

/// A VM instance bound to the calling thread.
pub struct ScriptRuntime {
    vm: ScriptState,
    bridge: Rc<Bridge>,
    tasks: TaskQueue,
}

impl ScriptRuntime {
    /// Runtime over `domain` with default options
    pub fn new(domain: Rc<TypeDomain>) -> Self {
        Self::with_options(domain, BridgeOptions::default())
    }

    /// Runtime over `domain` with the given limits
    pub fn with_options(domain: Rc<TypeDomain>, options: BridgeOptions) -> Self {
        let mut vm = ScriptState::with_options(&options);
        let tasks = TaskQueue::new(options.task_queue_capacity);
        let bridge = Bridge::new(domain, options);
        bridge.install(&mut vm);
        log::debug!("script runtime created");
        Self { vm, bridge, tasks }
    }

    /// The VM
    pub fn vm(&self) -> &ScriptState {
        &self.vm
    }

    /// The VM, mutably
    pub fn vm_mut(&mut self) -> &mut ScriptState {
        &mut self.vm
    }

    /// The bridge serving this VM
    pub fn bridge(&self) -> &Rc<Bridge> {
        &self.bridge
    }

    /// Sending half of the task queue, for other threads
    pub fn sender(&self) -> TaskSender {
        self.tasks.sender()
    }

    /// Number of queued tasks
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Drain queued tasks for one time slice, then run pending finalizers
    pub fn tick(&mut self) -> TickStats {
        self.bridge.owner.assert_owner();
        let tasks = self
            .tasks
            .drain(&mut self.vm, &self.bridge, self.bridge.options().tick_budget());
        let finalized = self.vm.collect_garbage();
        TickStats { tasks, finalized }
    }

    /// Call the global function `name`.
    ///
    /// Errors are logged with their traceback before being returned.
    pub fn call_global(&mut self, name: &str, args: &[ScriptValue]) -> Result<Vec<ScriptValue>, ScriptError> {
        self.bridge.owner.assert_owner();
        let func = self.vm.get_global(name);
        if func.is_nil() {
            let err = ScriptError::new(format!("attempt to call a nil value (global '{}')", name));
            log::error!("{}", err);
            return Err(err);
        }
        self.vm.call_value(&func, args).map_err(|err| {
            log::error!("{}\n{}", err.message, err.traceback);
            err
        })
    }

    /// Call `member` on the object or class behind `handle`
    pub fn call(&mut self, handle: ObjectHandle, member: &str, args: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
        self.bridge.call(&mut self.vm, handle, member, args)
    }

    /// Load an image into the domain this runtime sees
    pub fn load_image(&mut self, image: &Image) -> Result<Vec<TypeId>, ImageError> {
        self.bridge.owner.assert_owner();
        let ids = self.bridge.domain().load_image(image)?;
        log::info!("loaded image {} ({} types)", image.name, ids.len());
        Ok(ids)
    }

    /// Load a function from a chunk blob
    pub fn load_chunk(&self, blob: &[u8], chunk_name: &str) -> Result<FunctionRef, ScriptError> {
        self.vm.load(blob, chunk_name)
    }

    /// Dump a function into a chunk blob
    pub fn dump_chunk(&self, func: &FunctionRef) -> Result<Vec<u8>, ScriptError> {
        self.vm.dump(func)
    }

    /// Forget cached resolutions after script code was reloaded
    pub fn reload(&mut self) {
        self.bridge.clear_method_cache();
    }
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("bridge", &self.bridge)
            .field("pending_tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Ownership, TaskError};
    use crate::host::{HostType, HostValue, MethodBuilder, TypeBuilder};

    fn runtime(options: BridgeOptions) -> ScriptRuntime {
        let domain = TypeDomain::new();
        domain
            .define(
                TypeBuilder::class("Game.Counter")
                    .field("value", HostType::i32())
                    .method(MethodBuilder::constructor())
                    .method(
                        MethodBuilder::method("Add")
                            .param("n", HostType::i32())
                            .returns(HostType::i32())
                            .native(|inv| {
                                let n = inv.arg_i64(0)?;
                                let this = inv.this()?;
                                let value = this.get(0).and_then(|v| v.as_i64()).unwrap_or(0) + n;
                                this.set(0, HostValue::Int(value));
                                Ok(HostValue::Int(value))
                            }),
                    ),
            )
            .unwrap();
        ScriptRuntime::with_options(Rc::new(domain), options)
    }

    #[test]
    fn test_tick_runs_posted_tasks() {
        let mut rt = runtime(BridgeOptions::default());
        let sender = rt.sender();
        std::thread::spawn(move || {
            sender
                .post(|vm, _| {
                    vm.set_global("ready", true);
                    Ok(())
                })
                .unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(rt.pending_tasks(), 1);
        let stats = rt.tick();
        assert_eq!(stats.tasks, 1);
        assert_eq!(rt.vm().get_global("ready"), ScriptValue::Bool(true));
        assert_eq!(rt.tick(), TickStats::default());
    }

    #[test]
    fn test_full_queue_rejects() {
        let options = BridgeOptions {
            task_queue_capacity: 1,
            ..BridgeOptions::default()
        };
        let rt = runtime(options);
        let sender = rt.sender();
        sender.post(|_, _| Ok(())).unwrap();
        assert_eq!(sender.post(|_, _| Ok(())), Err(TaskError::Full));
    }

    #[test]
    fn test_failed_task_does_not_stop_tick() {
        let mut rt = runtime(BridgeOptions::default());
        let sender = rt.sender();
        sender.post(|_, _| Err(ScriptError::new("boom"))).unwrap();
        sender
            .post(|vm, _| {
                vm.set_global("after", 1.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(rt.tick().tasks, 2);
        assert_eq!(rt.vm().get_global("after"), ScriptValue::Number(1.0));
    }

    #[test]
    fn test_call_global() {
        let mut rt = runtime(BridgeOptions::default());
        let double = FunctionRef::new("double", |vm| {
            let n = vm.value_at(1).as_number().unwrap_or(0.0);
            vm.push(n * 2.0);
            Ok(1)
        });
        rt.vm_mut().set_global("double", double);
        assert_eq!(
            rt.call_global("double", &[ScriptValue::Number(21.0)]).unwrap(),
            vec![ScriptValue::Number(42.0)]
        );

        let err = rt.call_global("missing", &[]).unwrap_err();
        assert!(err.message.contains("global 'missing'"));
    }

    #[test]
    fn test_call_through_handle() {
        let mut rt = runtime(BridgeOptions::default());
        let ty = rt.bridge().domain().lookup("Game.Counter").unwrap();
        let obj = rt.bridge().domain().instantiate(ty).unwrap();
        let handle = rt.bridge().wrap(&obj, Ownership::Strong);
        assert_eq!(
            rt.call(handle, "Add", &[ScriptValue::Number(5.0)]).unwrap(),
            vec![ScriptValue::Number(5.0)]
        );
        assert_eq!(rt.bridge().cache().population(), 1);
        rt.reload();
        assert_eq!(rt.bridge().cache().population(), 0);
    }

    #[test]
    fn test_chunk_passthrough() {
        let mut rt = runtime(BridgeOptions::default());
        rt.vm_mut().define_prototype("answer", |vm| {
            vm.push(42.0);
            Ok(1)
        });
        let func = rt.vm().load_prototype("answer").unwrap();
        let blob = rt.dump_chunk(&func).unwrap();
        let loaded = rt.load_chunk(&blob, "answer.chunk").unwrap();
        assert_eq!(
            rt.vm_mut().call_function(&loaded, &[], 1).unwrap(),
            vec![ScriptValue::Number(42.0)]
        );
    }
}
