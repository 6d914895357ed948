//! Patch hub runtime
//!
//! Injected prologues call the hub with `(signature, token, target, carrier)`.
//! The hub looks the signature up in the patch table:
//!
//! - miss: no override, the original body runs;
//! - hit: the patch function is called with `(self?, args...)` and returns
//!   `(override, return value?, ref/out values...)`.
//!
//! A patch that raises, or returns values that do not convert, never reaches
//! the patched call site. The failure is logged and the original body runs.

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{CallContext, HostValue, ParamMode, PatchRequest, TypeDomain};
use crate::vm::{FunctionRef, ScriptState, ScriptValue, StackGuard};

/// Call context of host code invoked from script: patched calls are routed
/// back into the VM.
pub struct BridgeCallContext<'a> {
    vm: &'a mut ScriptState,
    bridge: &'a Bridge,
}

impl<'a> BridgeCallContext<'a> {
    /// Context for calls made on behalf of `vm`
    pub fn new(vm: &'a mut ScriptState, bridge: &'a Bridge) -> Self {
        Self { vm, bridge }
    }
}

impl CallContext for BridgeCallContext<'_> {
    fn domain(&self) -> &TypeDomain {
        self.bridge.domain()
    }

    fn dispatch_patch(&mut self, request: &PatchRequest) -> bool {
        let Some(func) = self.bridge.patches.borrow().find(&request.signature).cloned() else {
            return false;
        };
        let outcome = {
            let mut vm = StackGuard::new(&mut *self.vm);
            self.bridge.run_patch(&mut *vm, &func, request)
        };
        match outcome {
            Ok(overridden) => {
                log::trace!("patch {} -> override={}", request.signature, overridden);
                overridden
            }
            Err(err) => {
                let traceback = match &err {
                    BridgeError::Script(script) => script.traceback.clone(),
                    _ => String::new(),
                };
                let failure = BridgeError::PatchExecutionFailed {
                    signature: request.signature.clone(),
                    message: err.to_string(),
                };
                log::error!("{}\n{}", failure, traceback);
                false
            }
        }
    }

    fn step_limit(&self) -> u64 {
        self.bridge.options().il_step_limit
    }
}

impl Bridge {
    /// Run a patch for `request`, writing its results into the carrier.
    ///
    /// Returns whether the patch overrides the original body. Results are
    /// converted before anything is written, so a failed conversion leaves
    /// the carrier untouched.
    pub(crate) fn run_patch(
        &self,
        vm: &mut ScriptState,
        func: &FunctionRef,
        request: &PatchRequest,
    ) -> BridgeResult<bool> {
        let method = &request.method;
        let mut args = Vec::with_capacity(method.params.len() + 1);
        if let Some(target) = &request.target {
            args.push(self.to_script(vm, &HostValue::Object(target.clone()))?);
        }
        for (i, param) in method.params.iter().enumerate() {
            if param.is_input() {
                let value = request.carrier.get(i).unwrap_or_default();
                args.push(self.to_script(vm, &value)?);
            }
        }

        let results = vm.call_value(&ScriptValue::Function(func.clone()), &args)?;
        let mut results = results.into_iter();
        if !results.next().map(|v| v.truthy()).unwrap_or(false) {
            return Ok(false);
        }

        let mut staged = Vec::new();
        if method.returns_value() {
            let value = results.next().unwrap_or_default();
            staged.push((request.return_slot(), self.to_host_slot(&value, &method.ret, ParamMode::Out)?));
        }
        for (i, param) in method.params.iter().enumerate() {
            if param.is_by_ref() {
                let value = results.next().unwrap_or_default();
                staged.push((i, self.to_host_slot(&value, &param.ty, ParamMode::Out)?));
            }
        }
        for (slot, value) in staged {
            request.carrier.set(slot, value);
        }
        Ok(true)
    }
}
