//! Script VM state: value stack, call frames, globals, metatables
//!
//! This is the embedded VM the bridge talks to. It exposes the classic
//! C-style stack API of embeddable scripting runtimes:
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ result / temporaries        │  ← top (index -1)
//! │ arg₂                        │
//! │ arg₁                        │  ← frame base (index 1)
//! ├─────────────────────────────┤
//! │ callee                      │
//! │ caller frame ...            │
//! └─────────────────────────────┘
//! ```
//!
//! Positive indices are relative to the current frame base (1-based),
//! negative indices are relative to the top of the stack.
//!
//! All calls return `Result`: a script error never unwinds through host code.
//! A call that fails leaves the stack at the depth it had before the callee
//! was pushed.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::config::BridgeOptions;
use crate::error::ScriptError;
use crate::vm::value::{FunctionRef, Graveyard, MetaKey, NativeBody, ScriptTag, ScriptValue, UserData};

/// Pass as `nresults` to keep every value a call returns
pub const MULTRET: i32 = -1;

/// Activation record of a running native body
#[derive(Debug, Clone)]
struct Frame {
    /// Absolute stack index of the first argument
    base: usize,
    /// Function name for tracebacks
    name: String,
}

/// Per-type behavior of handle values.
#[derive(Debug, Clone, Default)]
pub struct Metatable {
    /// Name used in diagnostics
    pub name: String,
    /// `handle[key]` read
    pub index: Option<FunctionRef>,
    /// `handle[key] = value` write
    pub newindex: Option<FunctionRef>,
    /// `handle(args...)`
    pub call: Option<FunctionRef>,
    /// `tostring(handle)`
    pub tostring: Option<FunctionRef>,
    /// Finalizer; receives the raw slot as a light pointer
    pub gc: Option<FunctionRef>,
}

/// The embedded script VM.
pub struct ScriptState {
    stack: Vec<ScriptValue>,
    frames: Vec<Frame>,
    globals: FxHashMap<String, ScriptValue>,
    metatables: Vec<Metatable>,
    graveyard: Graveyard,
    pub(crate) prototypes: FxHashMap<String, Rc<NativeBody>>,
    max_stack: usize,
    max_depth: usize,
}

impl ScriptState {
    /// Create a VM with default limits
    pub fn new() -> Self {
        Self::with_options(&BridgeOptions::default())
    }

    /// Create a VM with the limits from `options`
    pub fn with_options(options: &BridgeOptions) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(32),
            globals: FxHashMap::default(),
            metatables: Vec::new(),
            graveyard: Rc::new(RefCell::new(Vec::new())),
            prototypes: FxHashMap::default(),
            max_stack: options.max_stack_slots,
            max_depth: options.max_call_depth,
        }
    }

    // ========================================================================
    // Stack Operations
    // ========================================================================

    fn base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }

    /// Number of values in the current frame
    pub fn top(&self) -> usize {
        self.stack.len() - self.base()
    }

    /// Absolute stack depth (used by guards to restore the stack)
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Restore the stack to an absolute depth, never below the current frame
    pub fn truncate(&mut self, depth: usize) {
        let depth = depth.max(self.base());
        self.stack.truncate(depth);
    }

    /// Set the number of values in the current frame, padding with nil
    pub fn set_top(&mut self, count: usize) {
        let target = self.base() + count;
        self.stack.resize(target, ScriptValue::Nil);
    }

    fn absolute(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            (pos < self.stack.len()).then_some(pos)
        } else if idx < 0 {
            let back = idx.unsigned_abs() as usize;
            let len = self.stack.len();
            (back <= len - base).then(|| len - back)
        } else {
            None
        }
    }

    /// Push a value
    pub fn push(&mut self, value: impl Into<ScriptValue>) {
        self.stack.push(value.into());
    }

    /// Pop `n` values (never below the current frame)
    pub fn pop(&mut self, n: usize) {
        let len = self.stack.len();
        self.truncate(len.saturating_sub(n));
    }

    /// Pop the top value, or nil if the frame is empty
    pub fn pop_value(&mut self) -> ScriptValue {
        if self.top() == 0 {
            return ScriptValue::Nil;
        }
        self.stack.pop().unwrap_or_default()
    }

    /// Value at `idx`, nil if the index is out of range
    pub fn value_at(&self, idx: i32) -> ScriptValue {
        self.absolute(idx)
            .map(|pos| self.stack[pos].clone())
            .unwrap_or_default()
    }

    /// Tag of the value at `idx`, `None` if the index is out of range
    pub fn type_at(&self, idx: i32) -> Option<ScriptTag> {
        self.absolute(idx).map(|pos| self.stack[pos].tag())
    }

    /// All values of the current frame, bottom first
    pub fn frame_values(&self) -> Vec<ScriptValue> {
        self.stack[self.base()..].to_vec()
    }

    /// Argument `idx` as UTF-8 text, raising a script error otherwise
    pub fn check_str(&self, idx: i32) -> Result<String, ScriptError> {
        match self.value_at(idx) {
            ScriptValue::String(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(self.error(format!(
                "bad argument #{} (string expected, got {})",
                idx,
                other.tag()
            ))),
        }
    }

    // ========================================================================
    // Globals and Metatables
    // ========================================================================

    /// Set a global value
    pub fn set_global(&mut self, name: &str, value: impl Into<ScriptValue>) {
        self.globals.insert(name.to_string(), value.into());
    }

    /// Get a global value (nil if unset)
    pub fn get_global(&self, name: &str) -> ScriptValue {
        self.globals.get(name).cloned().unwrap_or_default()
    }

    /// Register a native function as a global
    pub fn register(
        &mut self,
        name: &str,
        body: impl Fn(&mut ScriptState) -> Result<usize, ScriptError> + 'static,
    ) {
        let func = FunctionRef::new(name, body);
        self.set_global(name, func);
    }

    /// Create an empty metatable and return its key
    pub fn new_metatable(&mut self, name: impl Into<String>) -> MetaKey {
        self.metatables.push(Metatable {
            name: name.into(),
            ..Metatable::default()
        });
        (self.metatables.len() - 1) as MetaKey
    }

    /// Get a metatable
    pub fn metatable(&self, key: MetaKey) -> Option<&Metatable> {
        self.metatables.get(key as usize)
    }

    /// Get a metatable for modification
    pub fn metatable_mut(&mut self, key: MetaKey) -> Option<&mut Metatable> {
        self.metatables.get_mut(key as usize)
    }

    /// Create a handle wrapper for a registry slot
    pub fn new_userdata(&self, slot: u64, meta: MetaKey) -> ScriptValue {
        ScriptValue::Handle(UserData::new(slot, meta, &self.graveyard))
    }

    fn metamethod(
        &self,
        value: &ScriptValue,
        pick: impl Fn(&Metatable) -> Option<FunctionRef>,
    ) -> Option<FunctionRef> {
        let ud = value.as_userdata()?;
        self.metatables.get(ud.meta() as usize).and_then(pick)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call the value below the top `nargs` values.
    ///
    /// Results replace the callee and its arguments. `nresults` pads or
    /// truncates the results unless it is [`MULTRET`].
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<(), ScriptError> {
        if nargs + 1 > self.top() {
            return Err(self.error("attempt to call with too few values on the stack"));
        }
        let func_pos = self.stack.len() - nargs - 1;
        let callee = self.stack[func_pos].clone();
        let func = match &callee {
            ScriptValue::Function(f) => f.clone(),
            ScriptValue::Handle(_) => match self.metamethod(&callee, |m| m.call.clone()) {
                Some(f) => {
                    // __call receives the handle itself as its first argument
                    self.stack.insert(func_pos, ScriptValue::Function(f.clone()));
                    f
                }
                None => {
                    self.stack.truncate(func_pos);
                    return Err(self.error("attempt to call a handle value"));
                }
            },
            other => {
                let msg = format!("attempt to call a {} value", other.tag());
                self.stack.truncate(func_pos);
                return Err(self.error(msg));
            }
        };
        self.invoke(func_pos, &func, nresults)
    }

    fn invoke(&mut self, func_pos: usize, func: &FunctionRef, nresults: i32) -> Result<(), ScriptError> {
        if self.frames.len() >= self.max_depth || self.stack.len() >= self.max_stack {
            self.stack.truncate(func_pos);
            return Err(self.error("stack overflow"));
        }
        self.frames.push(Frame {
            base: func_pos + 1,
            name: func.name().to_string(),
        });
        let body = func.body();
        let result = match body(self) {
            Ok(count) => {
                let len = self.stack.len();
                let count = count.min(len - (func_pos + 1));
                let results = self.stack.split_off(len - count);
                self.stack.truncate(func_pos);
                self.push_results(results, nresults);
                Ok(())
            }
            Err(err) => {
                let err = err.with_traceback(self.traceback());
                self.stack.truncate(func_pos);
                Err(err)
            }
        };
        self.frames.pop();
        result
    }

    fn push_results(&mut self, mut results: Vec<ScriptValue>, nresults: i32) {
        if nresults >= 0 {
            results.resize(nresults as usize, ScriptValue::Nil);
        }
        self.stack.extend(results);
    }

    /// Protected call.
    ///
    /// Like [`call`](Self::call), but a panic inside a native body is also
    /// converted into a [`ScriptError`] and the frame/stack state is restored.
    pub fn pcall(&mut self, nargs: usize, nresults: i32) -> Result<(), ScriptError> {
        let frames = self.frames.len();
        let func_pos = self.stack.len().saturating_sub(nargs + 1);
        match panic::catch_unwind(AssertUnwindSafe(|| self.call(nargs, nresults))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "native function panicked".to_string());
                let err = ScriptError::new(message).with_traceback(self.traceback());
                self.frames.truncate(frames);
                self.stack.truncate(func_pos);
                Err(err)
            }
        }
    }

    /// Call a function with `args`, returning its results
    pub fn call_function(
        &mut self,
        func: &FunctionRef,
        args: &[ScriptValue],
        nresults: i32,
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        let depth = self.stack.len();
        self.push(func.clone());
        self.stack.extend_from_slice(args);
        self.call(args.len(), nresults)?;
        Ok(self.stack.split_off(depth))
    }

    /// Protected call of any callable value, returning every result
    pub fn call_value(
        &mut self,
        callee: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        let depth = self.stack.len();
        self.push(callee.clone());
        self.stack.extend_from_slice(args);
        self.pcall(args.len(), MULTRET)?;
        Ok(self.stack.split_off(depth))
    }

    /// `target[key]`
    pub fn index(&mut self, target: &ScriptValue, key: impl Into<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let handler = self
            .metamethod(target, |m| m.index.clone())
            .ok_or_else(|| self.error(format!("attempt to index a {} value", target.tag())))?;
        let mut results = self.call_function(&handler, &[target.clone(), key.into()], 1)?;
        Ok(results.pop().unwrap_or_default())
    }

    /// `target[key] = value`
    pub fn set_index(
        &mut self,
        target: &ScriptValue,
        key: impl Into<ScriptValue>,
        value: impl Into<ScriptValue>,
    ) -> Result<(), ScriptError> {
        let handler = self
            .metamethod(target, |m| m.newindex.clone())
            .ok_or_else(|| self.error(format!("attempt to index a {} value", target.tag())))?;
        self.call_function(&handler, &[target.clone(), key.into(), value.into()], 0)?;
        Ok(())
    }

    /// `target:method(args...)`
    pub fn method_call(
        &mut self,
        target: &ScriptValue,
        method: &str,
        args: &[ScriptValue],
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        let func = self.index(target, method)?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(target.clone());
        full.extend_from_slice(args);
        self.call_value(&func, &full)
    }

    /// `tostring(value)`
    pub fn to_display(&mut self, value: &ScriptValue) -> Result<String, ScriptError> {
        if let Some(handler) = self.metamethod(value, |m| m.tostring.clone()) {
            let mut results = self.call_function(&handler, &[value.clone()], 1)?;
            return match results.pop() {
                Some(ScriptValue::String(s)) => Ok(String::from_utf8_lossy(&s).into_owned()),
                _ => Err(self.error("'__tostring' must return a string")),
            };
        }
        Ok(match value {
            ScriptValue::Nil => "nil".to_string(),
            ScriptValue::Bool(b) => b.to_string(),
            ScriptValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            ScriptValue::Number(n) => n.to_string(),
            ScriptValue::String(s) => String::from_utf8_lossy(s).into_owned(),
            ScriptValue::LightPointer(p) => format!("lightpointer: {:#x}", p),
            ScriptValue::Handle(ud) => format!("handle: {:#x}", ud.slot()),
            ScriptValue::Function(f) => format!("function: {}", f.name()),
        })
    }

    // ========================================================================
    // Errors and Collection
    // ========================================================================

    /// Traceback of the active frames, innermost first
    pub fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for frame in self.frames.iter().rev() {
            out.push_str("\n\t[native]: in function '");
            out.push_str(&frame.name);
            out.push('\'');
        }
        out
    }

    /// Build a script error carrying the current traceback
    pub fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::new(message).with_traceback(self.traceback())
    }

    /// Number of handle wrappers waiting for finalization
    pub fn pending_finalizers(&self) -> usize {
        self.graveyard.borrow().len()
    }

    /// Run finalizers of every unreachable handle wrapper.
    ///
    /// Finalizer errors are logged and do not stop the collection. Returns
    /// the number of wrappers finalized.
    pub fn collect_garbage(&mut self) -> usize {
        let mut finalized = 0;
        loop {
            let pending = std::mem::take(&mut *self.graveyard.borrow_mut());
            if pending.is_empty() {
                break;
            }
            for (meta, slot) in pending {
                if let Some(gc) = self.metatables.get(meta as usize).and_then(|m| m.gc.clone()) {
                    let depth = self.stack.len();
                    if let Err(err) =
                        self.call_function(&gc, &[ScriptValue::LightPointer(slot as usize)], 0)
                    {
                        log::error!("finalizer for slot {:#x} failed: {}", slot, err);
                    }
                    self.stack.truncate(depth);
                }
                finalized += 1;
            }
        }
        finalized
    }
}

impl Default for ScriptState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptState")
            .field("depth", &self.stack.len())
            .field("frames", &self.frames.len())
            .field("globals", &self.globals.len())
            .field("metatables", &self.metatables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(vm: &mut ScriptState) -> Result<usize, ScriptError> {
        let a = vm.value_at(1).as_number().unwrap_or(0.0);
        let b = vm.value_at(2).as_number().unwrap_or(0.0);
        vm.push(a + b);
        Ok(1)
    }

    #[test]
    fn test_push_pop_and_type_at() {
        let mut vm = ScriptState::new();
        vm.push(1.0);
        vm.push("two");
        vm.push(true);
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.type_at(1), Some(ScriptTag::Number));
        assert_eq!(vm.type_at(-2), Some(ScriptTag::String));
        assert_eq!(vm.type_at(4), None);
        vm.pop(2);
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.pop_value(), ScriptValue::Number(1.0));
        assert_eq!(vm.pop_value(), ScriptValue::Nil);
    }

    #[test]
    fn test_call_adjusts_results() {
        let mut vm = ScriptState::new();
        vm.push(FunctionRef::new("add", add));
        vm.push(2.0);
        vm.push(3.0);
        vm.call(2, 3).unwrap();
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.value_at(1), ScriptValue::Number(5.0));
        assert!(vm.value_at(2).is_nil());
    }

    #[test]
    fn test_error_restores_depth_and_carries_traceback() {
        let mut vm = ScriptState::new();
        vm.push("sentinel");
        let inner = FunctionRef::new("inner", |vm| Err(vm.error("boom")));
        let outer = FunctionRef::new("outer", move |vm| {
            vm.call_function(&inner, &[], 0)?;
            Ok(0)
        });
        vm.push(outer);
        vm.push(1.0);
        let err = vm.pcall(1, 0).unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(err.traceback.contains("'inner'"));
        assert!(err.traceback.contains("'outer'"));
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.value_at(1).as_str(), Some("sentinel"));
    }

    #[test]
    fn test_pcall_converts_panics() {
        let mut vm = ScriptState::new();
        vm.push(FunctionRef::new("bad", |_vm| panic!("native fault")));
        let err = vm.pcall(0, 0).unwrap_err();
        assert_eq!(err.message, "native fault");
        assert_eq!(vm.depth(), 0);
        // The VM is still usable after the fault
        vm.push(FunctionRef::new("add", add));
        vm.push(1.0);
        vm.push(1.0);
        vm.pcall(2, 1).unwrap();
        assert_eq!(vm.pop_value(), ScriptValue::Number(2.0));
    }

    #[test]
    fn test_calling_non_function_fails() {
        let mut vm = ScriptState::new();
        vm.push(4.0);
        let err = vm.pcall(0, 0).unwrap_err();
        assert!(err.message.contains("attempt to call a number value"));
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn test_recursion_limit() {
        let mut vm = ScriptState::with_options(&BridgeOptions {
            max_call_depth: 8,
            ..BridgeOptions::default()
        });
        vm.register("recurse", |vm| {
            let me = vm.get_global("recurse");
            vm.call_value(&me, &[])?;
            Ok(0)
        });
        let f = vm.get_global("recurse");
        let err = vm.call_value(&f, &[]).unwrap_err();
        assert_eq!(err.message, "stack overflow");
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn test_handle_call_and_index_through_metatable() {
        let mut vm = ScriptState::new();
        let meta = vm.new_metatable("Thing");
        {
            let mt = vm.metatable_mut(meta).unwrap();
            mt.call = Some(FunctionRef::new("__call", |vm| {
                let n = vm.top();
                vm.push(n as f64);
                Ok(1)
            }));
            mt.index = Some(FunctionRef::new("__index", |vm| {
                let key = vm.check_str(2)?;
                vm.push(format!("key:{}", key));
                Ok(1)
            }));
        }
        let handle = vm.new_userdata(7, meta);
        let results = vm.call_value(&handle, &[1.0.into(), 2.0.into()]).unwrap();
        // The handle itself is passed as the first argument
        assert_eq!(results, vec![ScriptValue::Number(3.0)]);
        let value = vm.index(&handle, "Name").unwrap();
        assert_eq!(value.as_str(), Some("key:Name"));
    }

    #[test]
    fn test_collect_garbage_runs_finalizers() {
        let mut vm = ScriptState::new();
        let meta = vm.new_metatable("Thing");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        vm.metatable_mut(meta).unwrap().gc = Some(FunctionRef::new("__gc", move |vm| {
            if let ScriptValue::LightPointer(slot) = vm.value_at(1) {
                sink.borrow_mut().push(slot);
            }
            Ok(0)
        }));
        let handle = vm.new_userdata(11, meta);
        vm.push(handle);
        assert_eq!(vm.collect_garbage(), 0);
        vm.pop(1);
        assert_eq!(vm.pending_finalizers(), 1);
        assert_eq!(vm.collect_garbage(), 1);
        assert_eq!(seen.borrow().as_slice(), &[11]);
    }

    #[test]
    fn test_to_display() {
        let mut vm = ScriptState::new();
        assert_eq!(vm.to_display(&ScriptValue::Number(3.0)).unwrap(), "3");
        assert_eq!(vm.to_display(&ScriptValue::Number(2.5)).unwrap(), "2.5");
        assert_eq!(vm.to_display(&ScriptValue::Nil).unwrap(), "nil");
    }
}
