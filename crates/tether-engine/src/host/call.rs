//! Host method invocation
//!
//! [`invoke`] is the single entry point for running a host method, whatever
//! its body. Everything a body needs from its surroundings (the type domain,
//! the patch table, execution limits) is reached through [`CallContext`].

use std::sync::Arc;

use crate::host::domain::TypeDomain;
use crate::host::il;
use crate::host::meta::{HostException, MethodBody, MethodInfo};
use crate::host::object::{HostValue, ObjectRef};
use crate::host::types::{HostType, MethodKind, MethodToken, NumericKind, ParamInfo};

/// Default instruction budget of one IL invocation
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Environment a host method runs in.
pub trait CallContext {
    /// Type domain the method belongs to
    fn domain(&self) -> &TypeDomain;

    /// Consult the patch table for a hot-patched call.
    ///
    /// Returns `true` when the patch overrides the original body. On `true`
    /// the carrier holds the substitute return value and ref/out values.
    fn dispatch_patch(&mut self, request: &PatchRequest) -> bool;

    /// Instruction budget of one IL invocation
    fn step_limit(&self) -> u64 {
        DEFAULT_STEP_LIMIT
    }
}

/// A call diverted into the patch hub
#[derive(Debug)]
pub struct PatchRequest {
    /// Signature string of the patched method
    pub signature: String,
    /// The patched method
    pub method: Arc<MethodInfo>,
    /// `this`, or `None` for static methods
    pub target: Option<ObjectRef>,
    /// Argument carrier: one slot per parameter, then the return slot
    pub carrier: ObjectRef,
}

impl PatchRequest {
    /// Carrier slot of the return value
    pub fn return_slot(&self) -> usize {
        self.method.params.len()
    }
}

/// Context with no patch table: every patched call runs its original body
pub struct DirectContext<'d> {
    domain: &'d TypeDomain,
    step_limit: u64,
}

impl<'d> DirectContext<'d> {
    /// Context over `domain` with the default step limit
    pub fn new(domain: &'d TypeDomain) -> Self {
        Self {
            domain,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Override the step limit
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }
}

impl CallContext for DirectContext<'_> {
    fn domain(&self) -> &TypeDomain {
        self.domain
    }

    fn dispatch_patch(&mut self, _request: &PatchRequest) -> bool {
        false
    }

    fn step_limit(&self) -> u64 {
        self.step_limit
    }
}

/// Arguments of a running native method
pub struct Invocation<'a> {
    /// Method being run
    pub method: &'a MethodInfo,
    /// Receiver (the new object for constructors)
    pub this: Option<ObjectRef>,
    /// Arguments; ref/out slots are written back by the caller
    pub args: &'a mut [HostValue],
    /// Environment
    pub ctx: &'a mut dyn CallContext,
}

impl Invocation<'_> {
    /// Argument `index`, null if out of range
    pub fn arg(&self, index: usize) -> HostValue {
        self.args.get(index).cloned().unwrap_or_default()
    }

    /// Integer argument
    pub fn arg_i64(&self, index: usize) -> Result<i64, HostException> {
        self.arg(index)
            .as_i64()
            .ok_or_else(|| HostException::argument(format!("argument {} is not an integer", index)))
    }

    /// Write a ref/out argument
    pub fn set_arg(&mut self, index: usize, value: HostValue) -> Result<(), HostException> {
        let slot = self
            .args
            .get_mut(index)
            .ok_or_else(|| HostException::argument(format!("no argument {}", index)))?;
        *slot = value;
        Ok(())
    }

    /// Receiver, or `NullReferenceException` for static calls
    pub fn this(&self) -> Result<&ObjectRef, HostException> {
        self.this
            .as_ref()
            .ok_or_else(|| HostException::null_reference(format!("{} requires an instance", self.method.name)))
    }
}

/// Run `method`.
///
/// Constructors allocate the instance before their body runs and return it.
/// Ref/out parameters are written into `args` in place.
pub fn invoke(
    method: &MethodInfo,
    this: Option<ObjectRef>,
    args: &mut [HostValue],
    ctx: &mut dyn CallContext,
) -> Result<HostValue, HostException> {
    if args.len() != method.params.len() {
        return Err(HostException::new(
            "TargetParameterCountException",
            format!(
                "{} expects {} arguments, got {}",
                method.signature(),
                method.params.len(),
                args.len()
            ),
        ));
    }

    let this = match method.kind {
        MethodKind::Constructor => Some(ctx.domain().instantiate(method.declaring)?),
        MethodKind::Instance => Some(this.ok_or_else(|| {
            HostException::null_reference(format!("{} called without an instance", method.signature()))
        })?),
        MethodKind::Static => None,
    };

    let result = match &method.body {
        MethodBody::Native(f) => {
            let f = Arc::clone(f);
            let mut invocation = Invocation {
                method,
                this: this.clone(),
                args,
                ctx,
            };
            f(&mut invocation)?
        }
        MethodBody::Il(body) => il::execute(body, method, this.clone(), args, ctx)?,
        MethodBody::PatchHub => patch_hub(args, ctx)?,
        MethodBody::Abstract => {
            return Err(HostException::new(
                "NotImplementedException",
                format!("{} has no body", method.signature()),
            ))
        }
    };

    match (method.kind, this) {
        (MethodKind::Constructor, Some(obj)) => Ok(HostValue::Object(obj)),
        _ => Ok(result),
    }
}

/// Parameter list of the patch hub
pub fn hub_params() -> Vec<ParamInfo> {
    vec![
        ParamInfo::new("signature", HostType::String),
        ParamInfo::new("token", HostType::Numeric(NumericKind::I64)),
        ParamInfo::new("target", HostType::Object),
        ParamInfo::new("args", HostType::array(HostType::Object)),
    ]
}

/// Whether a method has the patch hub's shape
pub fn is_hub_shape(method_kind: MethodKind, params: &[ParamInfo], ret: &HostType) -> bool {
    let expected = hub_params();
    method_kind == MethodKind::Static
        && *ret == HostType::Bool
        && params.len() == expected.len()
        && params
            .iter()
            .zip(&expected)
            .all(|(p, e)| p.ty == e.ty && p.mode == e.mode)
}

fn patch_hub(args: &mut [HostValue], ctx: &mut dyn CallContext) -> Result<HostValue, HostException> {
    if args.len() != 4 {
        return Err(HostException::invalid_program("patch hub takes 4 arguments"));
    }
    let signature = args[0]
        .as_bytes()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .ok_or_else(|| HostException::argument("patch hub: signature must be a string"))?;
    let token = args[1]
        .as_i64()
        .and_then(|t| u32::try_from(t).ok())
        .map(MethodToken)
        .ok_or_else(|| HostException::argument("patch hub: invalid method token"))?;
    let target = args[2].as_object().cloned();
    let carrier = args[3]
        .as_object()
        .cloned()
        .ok_or_else(|| HostException::argument("patch hub: missing argument carrier"))?;

    let Some(method) = ctx.domain().method(token) else {
        log::warn!("patch hub: no method for token {} ({})", token, signature);
        return Ok(HostValue::Bool(false));
    };
    let return_slot = method.params.len();
    if carrier.len() != return_slot + 1 {
        return Err(HostException::argument(format!(
            "patch hub: carrier for {} has {} slots, expected {}",
            signature,
            carrier.len(),
            return_slot + 1
        )));
    }

    // A miss leaves the default of the declared return type in the return slot
    let default = if method.returns_value() {
        HostValue::default_for(&method.ret)
    } else {
        HostValue::Null
    };
    carrier.set(return_slot, default);

    let request = PatchRequest {
        signature,
        method,
        target,
        carrier,
    };
    Ok(HostValue::Bool(ctx.dispatch_patch(&request)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::domain::{MethodBuilder, TypeBuilder};
    use crate::host::types::ParamMode;

    fn domain() -> TypeDomain {
        let domain = TypeDomain::new();
        domain
            .define(
                TypeBuilder::class("Game.Math")
                    .method(
                        MethodBuilder::method("Add")
                            .static_()
                            .param("a", HostType::i32())
                            .param("b", HostType::i32())
                            .returns(HostType::i32())
                            .native(|inv| Ok(HostValue::Int(inv.arg_i64(0)? + inv.arg_i64(1)?))),
                    )
                    .method(
                        MethodBuilder::method("Split")
                            .static_()
                            .param("value", HostType::i32())
                            .param_out("high", HostType::i32())
                            .returns(HostType::Bool)
                            .native(|inv| {
                                let v = inv.arg_i64(0)?;
                                inv.set_arg(1, HostValue::Int(v / 10))?;
                                Ok(HostValue::Bool(v >= 10))
                            }),
                    ),
            )
            .unwrap();
        domain
    }

    #[test]
    fn test_invoke_native_static() {
        let domain = domain();
        let ty = domain.lookup("Game.Math").unwrap();
        let add = domain.get(ty).unwrap().methods[0].clone();
        let mut ctx = DirectContext::new(&domain);
        let mut args = vec![HostValue::Int(2), HostValue::Int(40)];
        assert_eq!(invoke(&add, None, &mut args, &mut ctx).unwrap(), HostValue::Int(42));
    }

    #[test]
    fn test_out_parameter_written_in_place() {
        let domain = domain();
        let ty = domain.get(domain.lookup("Game.Math").unwrap()).unwrap();
        let split = ty.methods_named("Split").next().unwrap().clone();
        assert_eq!(split.params[1].mode, ParamMode::Out);
        let mut ctx = DirectContext::new(&domain);
        let mut args = vec![HostValue::Int(47), HostValue::Int(0)];
        assert_eq!(invoke(&split, None, &mut args, &mut ctx).unwrap(), HostValue::Bool(true));
        assert_eq!(args[1], HostValue::Int(4));
    }

    #[test]
    fn test_argument_count_checked() {
        let domain = domain();
        let ty = domain.get(domain.lookup("Game.Math").unwrap()).unwrap();
        let mut ctx = DirectContext::new(&domain);
        let err = invoke(&ty.methods[0], None, &mut [], &mut ctx).unwrap_err();
        assert_eq!(err.kind, "TargetParameterCountException");
    }

    #[test]
    fn test_hub_shape() {
        assert!(is_hub_shape(MethodKind::Static, &hub_params(), &HostType::Bool));
        assert!(!is_hub_shape(MethodKind::Instance, &hub_params(), &HostType::Bool));
        assert!(!is_hub_shape(MethodKind::Static, &hub_params()[..3], &HostType::Bool));
    }
}
