//! Host intermediate language
//!
//! A compiled method body is a flat instruction sequence over an operand
//! stack. Branch targets are instruction indices, not byte offsets, so the
//! injector can relocate code by adding a constant.
//!
//! Named [`Anchor`] markers are no-ops at run time. The injector uses them to
//! delimit the blocks of a rewritten prologue, which keeps the transform
//! inspectable without decoding the surrounding code.

use serde::{Deserialize, Serialize};

use crate::host::call::{invoke, CallContext};
use crate::host::meta::{HostException, MethodInfo};
use crate::host::object::{HostValue, ObjectRef};
use crate::host::types::{HostType, MethodToken};

/// Named position inside an injected prologue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// Start of the block boxing `this` and the arguments into the carrier
    ArgMarshal,
    /// Start of the patch hub call
    HubCall,
    /// Branch on the hub's override flag
    VetoBranch,
    /// Start of the block copying ref/out values back out of the carrier
    RefOutWriteback,
    /// Start of the block returning the substitute value
    Return,
    /// First instruction of the original body
    Original,
}

/// One IL instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    /// No operation
    Nop,
    /// Injector marker (no operation)
    Anchor(Anchor),
    /// Push null
    LdNull,
    /// Push a boolean
    LdBool(bool),
    /// Push a signed integer
    LdInt(i64),
    /// Push a float
    LdFloat(f64),
    /// Push a string
    LdStr(String),
    /// Push a method's runtime identity as an integer
    LdToken(MethodToken),
    /// Push argument
    LdArg(u16),
    /// Pop into argument
    StArg(u16),
    /// Push local
    LdLoc(u16),
    /// Pop into local
    StLoc(u16),
    /// Push `this`
    LdThis,
    /// Pop object, push field slot
    LdFld(u16),
    /// Pop value and object, store field slot
    StFld(u16),
    /// Pop length, push a new array of the element type
    NewArr(HostType),
    /// Pop index and array, push element
    LdElem,
    /// Pop value, index and array, store element
    StElem,
    /// Pop two, push sum (or concatenation for strings)
    Add,
    /// Pop two, push difference
    Sub,
    /// Pop two, push product
    Mul,
    /// Pop two, push equality
    Ceq,
    /// Pop two, push `a < b`
    Clt,
    /// Duplicate top
    Dup,
    /// Discard top
    Pop,
    /// Unconditional branch
    Br(u32),
    /// Pop, branch if truthy
    BrTrue(u32),
    /// Pop, branch if falsy
    BrFalse(u32),
    /// Call a method (receiver below the arguments for instance methods)
    Call(MethodToken),
    /// Construct an object through a constructor
    NewObj(MethodToken),
    /// Pop a message and throw
    Throw,
    /// Return (pops the return value for non-void methods)
    Ret,
}

impl Instr {
    /// Branch target, if this is a branch
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) => Some(*t),
            _ => None,
        }
    }

    /// Mutable branch target, if this is a branch
    pub fn branch_target_mut(&mut self) -> Option<&mut u32> {
        match self {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) => Some(t),
            _ => None,
        }
    }

    /// Method token operand, if any
    pub fn token_mut(&mut self) -> Option<&mut MethodToken> {
        match self {
            Instr::LdToken(t) | Instr::Call(t) | Instr::NewObj(t) => Some(t),
            _ => None,
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(self, Instr::Ret | Instr::Throw | Instr::Br(_))
    }
}

/// Compiled method body
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IlBody {
    /// Local variable types; locals start at their type's default
    #[serde(default)]
    pub locals: Vec<HostType>,
    /// Instructions
    pub code: Vec<Instr>,
}

impl IlBody {
    /// Body without locals
    pub fn new(code: Vec<Instr>) -> Self {
        Self {
            locals: Vec::new(),
            code,
        }
    }

    /// Body with locals
    pub fn with_locals(locals: Vec<HostType>, code: Vec<Instr>) -> Self {
        Self { locals, code }
    }

    /// Index of an anchor, if present
    pub fn anchor(&self, anchor: Anchor) -> Option<usize> {
        self.code.iter().position(|i| *i == Instr::Anchor(anchor))
    }
}

// ============================================================================
// Verification
// ============================================================================

/// IL verification errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    /// Method body has no instructions
    #[error("Empty method body")]
    Empty,

    /// Pop from an empty stack
    #[error("Stack underflow at {0}")]
    StackUnderflow(usize),

    /// Two paths reach an instruction with different stack depths
    #[error("Inconsistent stack depth at {offset}: {expected} vs {found}")]
    StackMismatch {
        /// Instruction index
        offset: usize,
        /// Depth recorded first
        expected: usize,
        /// Depth found later
        found: usize,
    },

    /// Branch outside the body
    #[error("Invalid branch target {target} at {offset}")]
    InvalidBranchTarget {
        /// Target index
        target: u32,
        /// Instruction index
        offset: usize,
    },

    /// Argument index out of range
    #[error("Invalid argument index {index} (max {max}) at {offset}")]
    InvalidArgRef {
        /// Argument index
        index: u16,
        /// Number of parameters
        max: usize,
        /// Instruction index
        offset: usize,
    },

    /// Local index out of range
    #[error("Invalid local index {index} (max {max}) at {offset}")]
    InvalidLocalRef {
        /// Local index
        index: u16,
        /// Number of locals
        max: usize,
        /// Instruction index
        offset: usize,
    },

    /// `this` in a static method
    #[error("`this` used in a static method at {0}")]
    NoThis(usize),

    /// Token does not name a method
    #[error("Unknown method token {token} at {offset}")]
    UnknownToken {
        /// Token operand
        token: MethodToken,
        /// Instruction index
        offset: usize,
    },

    /// `Call` of a constructor or `NewObj` of a method
    #[error("Token {token} cannot be used with this instruction at {offset}")]
    BadCallTarget {
        /// Token operand
        token: MethodToken,
        /// Instruction index
        offset: usize,
    },

    /// `Ret` with the wrong number of values on the stack
    #[error("Return at {offset} leaves {depth} values on the stack")]
    BadReturn {
        /// Instruction index
        offset: usize,
        /// Stack depth at the return
        depth: usize,
    },

    /// Last reachable instruction falls through past the end
    #[error("Execution falls off end of method at {0}")]
    FallOffEnd(usize),
}

/// What the verifier needs to know about the method being verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodShape {
    /// Takes an implicit `this`
    pub has_this: bool,
    /// Number of declared parameters
    pub params: usize,
    /// `Ret` pops a value
    pub returns_value: bool,
}

impl MethodShape {
    /// Shape of a method descriptor
    pub fn of(method: &MethodInfo) -> Self {
        Self {
            has_this: method.has_this(),
            params: method.params.len(),
            returns_value: method.returns_value(),
        }
    }
}

/// Stack behavior of a call target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEffect {
    /// Number of declared parameters
    pub params: usize,
    /// Instance method (receiver is popped too)
    pub has_this: bool,
    /// Pushes a return value
    pub returns_value: bool,
    /// Constructor
    pub constructor: bool,
}

/// Verify `body` against `shape`, resolving call targets through `resolve`.
pub fn verify(
    body: &IlBody,
    shape: MethodShape,
    resolve: &dyn Fn(MethodToken) -> Option<CallEffect>,
) -> Result<(), VerifyError> {
    let code = &body.code;
    if code.is_empty() {
        return Err(VerifyError::Empty);
    }
    let mut depths: Vec<Option<usize>> = vec![None; code.len()];
    let mut worklist = vec![(0usize, 0usize)];

    while let Some((pc, depth)) = worklist.pop() {
        match depths[pc] {
            Some(expected) if expected == depth => continue,
            Some(expected) => {
                return Err(VerifyError::StackMismatch {
                    offset: pc,
                    expected,
                    found: depth,
                })
            }
            None => depths[pc] = Some(depth),
        }

        let instr = &code[pc];
        let (pops, pushes) = stack_effect(instr, pc, body, shape, resolve)?;
        if depth < pops {
            return Err(VerifyError::StackUnderflow(pc));
        }
        let after = depth - pops + pushes;

        if let Instr::Ret = instr {
            let expected = usize::from(shape.returns_value);
            if depth != expected {
                return Err(VerifyError::BadReturn { offset: pc, depth });
            }
        }

        if let Some(target) = instr.branch_target() {
            if target as usize >= code.len() {
                return Err(VerifyError::InvalidBranchTarget { target, offset: pc });
            }
            worklist.push((target as usize, after));
        }
        if !instr.is_terminator() {
            if pc + 1 >= code.len() {
                return Err(VerifyError::FallOffEnd(pc));
            }
            worklist.push((pc + 1, after));
        }
    }
    Ok(())
}

fn stack_effect(
    instr: &Instr,
    pc: usize,
    body: &IlBody,
    shape: MethodShape,
    resolve: &dyn Fn(MethodToken) -> Option<CallEffect>,
) -> Result<(usize, usize), VerifyError> {
    let check_arg = |index: u16| {
        if (index as usize) < shape.params {
            Ok(())
        } else {
            Err(VerifyError::InvalidArgRef {
                index,
                max: shape.params,
                offset: pc,
            })
        }
    };
    let check_local = |index: u16| {
        if (index as usize) < body.locals.len() {
            Ok(())
        } else {
            Err(VerifyError::InvalidLocalRef {
                index,
                max: body.locals.len(),
                offset: pc,
            })
        }
    };
    let lookup = |token: MethodToken| resolve(token).ok_or(VerifyError::UnknownToken { token, offset: pc });

    Ok(match instr {
        Instr::Nop | Instr::Anchor(_) | Instr::Br(_) => (0, 0),
        Instr::LdNull
        | Instr::LdBool(_)
        | Instr::LdInt(_)
        | Instr::LdFloat(_)
        | Instr::LdStr(_)
        | Instr::LdToken(_) => (0, 1),
        Instr::LdArg(i) => {
            check_arg(*i)?;
            (0, 1)
        }
        Instr::StArg(i) => {
            check_arg(*i)?;
            (1, 0)
        }
        Instr::LdLoc(i) => {
            check_local(*i)?;
            (0, 1)
        }
        Instr::StLoc(i) => {
            check_local(*i)?;
            (1, 0)
        }
        Instr::LdThis => {
            if !shape.has_this {
                return Err(VerifyError::NoThis(pc));
            }
            (0, 1)
        }
        Instr::LdFld(_) => (1, 1),
        Instr::StFld(_) => (2, 0),
        Instr::NewArr(_) => (1, 1),
        Instr::LdElem => (2, 1),
        Instr::StElem => (3, 0),
        Instr::Add | Instr::Sub | Instr::Mul | Instr::Ceq | Instr::Clt => (2, 1),
        Instr::Dup => (1, 2),
        Instr::Pop | Instr::BrTrue(_) | Instr::BrFalse(_) | Instr::Throw => (1, 0),
        Instr::Call(token) => {
            let effect = lookup(*token)?;
            if effect.constructor {
                return Err(VerifyError::BadCallTarget { token: *token, offset: pc });
            }
            (effect.params + usize::from(effect.has_this), usize::from(effect.returns_value))
        }
        Instr::NewObj(token) => {
            let effect = lookup(*token)?;
            if !effect.constructor {
                return Err(VerifyError::BadCallTarget { token: *token, offset: pc });
            }
            (effect.params, 1)
        }
        Instr::Ret => (usize::from(shape.returns_value), 0),
    })
}

// ============================================================================
// Interpreter
// ============================================================================

/// Run an IL body.
///
/// `args` is updated in place by `StArg`, which is how ref/out parameters
/// reach the caller.
pub fn execute(
    body: &IlBody,
    method: &MethodInfo,
    this: Option<ObjectRef>,
    args: &mut [HostValue],
    ctx: &mut dyn CallContext,
) -> Result<HostValue, HostException> {
    let mut locals: Vec<HostValue> = body.locals.iter().map(HostValue::default_for).collect();
    let mut stack: Vec<HostValue> = Vec::with_capacity(16);
    let limit = ctx.step_limit();
    let mut steps: u64 = 0;
    let mut pc = 0usize;

    loop {
        let instr = body
            .code
            .get(pc)
            .ok_or_else(|| HostException::invalid_program(format!("{} fell off its end", method.signature())))?;
        steps += 1;
        if steps > limit {
            return Err(HostException::new(
                "ExecutionEngineException",
                format!("step limit of {} exceeded in {}", limit, method.signature()),
            ));
        }
        pc += 1;

        match instr {
            Instr::Nop | Instr::Anchor(_) => {}
            Instr::LdNull => stack.push(HostValue::Null),
            Instr::LdBool(b) => stack.push(HostValue::Bool(*b)),
            Instr::LdInt(i) => stack.push(HostValue::Int(*i)),
            Instr::LdFloat(f) => stack.push(HostValue::Float(*f)),
            Instr::LdStr(s) => stack.push(HostValue::str(s)),
            Instr::LdToken(t) => stack.push(HostValue::Int(i64::from(t.0))),
            Instr::LdArg(i) => stack.push(slot(args, *i)?.clone()),
            Instr::StArg(i) => {
                let value = pop(&mut stack)?;
                *slot_mut(args, *i)? = value;
            }
            Instr::LdLoc(i) => stack.push(slot(&locals, *i)?.clone()),
            Instr::StLoc(i) => {
                let value = pop(&mut stack)?;
                *slot_mut(&mut locals, *i)? = value;
            }
            Instr::LdThis => {
                let obj = this
                    .clone()
                    .ok_or_else(|| HostException::invalid_program("`this` in a static method"))?;
                stack.push(HostValue::Object(obj));
            }
            Instr::LdFld(field) => {
                let obj = pop_object(&mut stack)?;
                let value = obj
                    .get(*field as usize)
                    .ok_or_else(|| HostException::invalid_program(format!("no field slot {}", field)))?;
                stack.push(value);
            }
            Instr::StFld(field) => {
                let value = pop(&mut stack)?;
                let obj = pop_object(&mut stack)?;
                if !obj.set(*field as usize, value) {
                    return Err(HostException::invalid_program(format!("no field slot {}", field)));
                }
            }
            Instr::NewArr(elem) => {
                let len = pop(&mut stack)?
                    .as_i64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| HostException::new("OverflowException", "invalid array length"))?;
                let array = ctx.domain().new_array(elem, vec![HostValue::default_for(elem); len]);
                stack.push(HostValue::Object(array));
            }
            Instr::LdElem => {
                let index = pop_index(&mut stack)?;
                let array = pop_object(&mut stack)?;
                let value = array.get(index).ok_or_else(|| out_of_range(index, array.len()))?;
                stack.push(value);
            }
            Instr::StElem => {
                let value = pop(&mut stack)?;
                let index = pop_index(&mut stack)?;
                let array = pop_object(&mut stack)?;
                if !array.set(index, value) {
                    return Err(out_of_range(index, array.len()));
                }
            }
            Instr::Add | Instr::Sub | Instr::Mul => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(arith(instr, a, b)?);
            }
            Instr::Ceq => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(HostValue::Bool(a == b));
            }
            Instr::Clt => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                    return Err(HostException::new("InvalidCastException", "comparison of non-numbers"));
                };
                stack.push(HostValue::Bool(x < y));
            }
            Instr::Dup => {
                let top = stack
                    .last()
                    .cloned()
                    .ok_or_else(|| HostException::invalid_program("stack underflow"))?;
                stack.push(top);
            }
            Instr::Pop => {
                pop(&mut stack)?;
            }
            Instr::Br(target) => pc = *target as usize,
            Instr::BrTrue(target) => {
                if pop(&mut stack)?.truthy() {
                    pc = *target as usize;
                }
            }
            Instr::BrFalse(target) => {
                if !pop(&mut stack)?.truthy() {
                    pc = *target as usize;
                }
            }
            Instr::Call(token) => {
                let callee = ctx
                    .domain()
                    .method(*token)
                    .ok_or_else(|| HostException::invalid_program(format!("unknown method token {}", token)))?;
                let mut call_args = pop_n(&mut stack, callee.params.len())?;
                let receiver = if callee.has_this() {
                    Some(pop_object(&mut stack)?)
                } else {
                    None
                };
                let result = invoke(&callee, receiver, &mut call_args, ctx)?;
                if callee.returns_value() {
                    stack.push(result);
                }
            }
            Instr::NewObj(token) => {
                let ctor = ctx
                    .domain()
                    .method(*token)
                    .ok_or_else(|| HostException::invalid_program(format!("unknown method token {}", token)))?;
                let mut call_args = pop_n(&mut stack, ctor.params.len())?;
                stack.push(invoke(&ctor, None, &mut call_args, ctx)?);
            }
            Instr::Throw => {
                let message = pop(&mut stack)?;
                return Err(HostException::new("Exception", text(&message)));
            }
            Instr::Ret => {
                return if method.returns_value() {
                    pop(&mut stack)
                } else {
                    Ok(HostValue::Null)
                };
            }
        }
    }
}

fn pop(stack: &mut Vec<HostValue>) -> Result<HostValue, HostException> {
    stack
        .pop()
        .ok_or_else(|| HostException::invalid_program("stack underflow"))
}

fn pop_n(stack: &mut Vec<HostValue>, n: usize) -> Result<Vec<HostValue>, HostException> {
    if stack.len() < n {
        return Err(HostException::invalid_program("stack underflow"));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn pop_object(stack: &mut Vec<HostValue>) -> Result<ObjectRef, HostException> {
    match pop(stack)? {
        HostValue::Object(obj) => Ok(obj),
        HostValue::Null => Err(HostException::null_reference("object reference not set")),
        other => Err(HostException::new(
            "InvalidCastException",
            format!("expected an object, got {:?}", other),
        )),
    }
}

fn pop_index(stack: &mut Vec<HostValue>) -> Result<usize, HostException> {
    pop(stack)?
        .as_i64()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| HostException::new("IndexOutOfRangeException", "invalid index"))
}

fn out_of_range(index: usize, len: usize) -> HostException {
    HostException::new(
        "IndexOutOfRangeException",
        format!("index {} outside array of length {}", index, len),
    )
}

fn slot(values: &[HostValue], index: u16) -> Result<&HostValue, HostException> {
    values
        .get(index as usize)
        .ok_or_else(|| HostException::invalid_program(format!("no slot {}", index)))
}

fn slot_mut(values: &mut [HostValue], index: u16) -> Result<&mut HostValue, HostException> {
    values
        .get_mut(index as usize)
        .ok_or_else(|| HostException::invalid_program(format!("no slot {}", index)))
}

/// Text form used by string concatenation and `Throw`
pub(crate) fn text(value: &HostValue) -> String {
    match value {
        HostValue::Null => String::new(),
        HostValue::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        HostValue::Int(i) => i.to_string(),
        HostValue::UInt(u) => u.to_string(),
        HostValue::Float(f) => f.to_string(),
        HostValue::Str(s) => String::from_utf8_lossy(s).into_owned(),
        HostValue::Pointer(p) => format!("{:#x}", p),
        HostValue::Object(o) => format!("object#{}", o.type_id().0),
    }
}

fn arith(op: &Instr, a: HostValue, b: HostValue) -> Result<HostValue, HostException> {
    if let Instr::Add = op {
        if matches!(a, HostValue::Str(_)) || matches!(b, HostValue::Str(_)) {
            return Ok(HostValue::str(format!("{}{}", text(&a), text(&b))));
        }
    }
    let floating = matches!(a, HostValue::Float(_)) || matches!(b, HostValue::Float(_));
    match (&a, &b) {
        _ if floating => {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return Err(invalid_operands(&a, &b));
            };
            Ok(HostValue::Float(match op {
                Instr::Add => x + y,
                Instr::Sub => x - y,
                _ => x * y,
            }))
        }
        (HostValue::UInt(x), HostValue::UInt(y)) => Ok(HostValue::UInt(match op {
            Instr::Add => x.wrapping_add(*y),
            Instr::Sub => x.wrapping_sub(*y),
            _ => x.wrapping_mul(*y),
        })),
        _ => {
            let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) else {
                return Err(invalid_operands(&a, &b));
            };
            Ok(HostValue::Int(match op {
                Instr::Add => x.wrapping_add(y),
                Instr::Sub => x.wrapping_sub(y),
                _ => x.wrapping_mul(y),
            }))
        }
    }
}

fn invalid_operands(a: &HostValue, b: &HostValue) -> HostException {
    HostException::new(
        "InvalidCastException",
        format!("invalid operands {:?} and {:?}", a, b),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::call::DirectContext;
    use crate::host::domain::TypeDomain;
    use crate::host::meta::MethodBody;
    use crate::host::object::TypeId;
    use crate::host::types::{MethodKind, ParamInfo};

    fn static_method(params: Vec<ParamInfo>, ret: HostType, body: IlBody) -> MethodInfo {
        MethodInfo {
            token: MethodToken(1),
            declaring: TypeId(0),
            declaring_name: "Test".to_string(),
            name: "Run".to_string(),
            kind: MethodKind::Static,
            params,
            ret,
            body: MethodBody::Il(body),
        }
    }

    fn run(method: &MethodInfo, args: &mut [HostValue]) -> Result<HostValue, HostException> {
        let domain = TypeDomain::new();
        let mut ctx = DirectContext::new(&domain).with_step_limit(1_000);
        let MethodBody::Il(body) = &method.body else { unreachable!() };
        execute(body, method, None, args, &mut ctx)
    }

    fn no_calls(_: MethodToken) -> Option<CallEffect> {
        None
    }

    #[test]
    fn test_loop_sums_to_argument() {
        // sum = 0; i = 0; while i < n { sum += i; i += 1 } return sum
        let body = IlBody::with_locals(
            vec![HostType::i64(), HostType::i64()],
            vec![
                Instr::LdLoc(1),   // 0
                Instr::LdArg(0),   // 1
                Instr::Clt,        // 2
                Instr::BrFalse(15), // 3
                Instr::LdLoc(0),   // 4
                Instr::LdLoc(1),   // 5
                Instr::Add,        // 6
                Instr::StLoc(0),   // 7
                Instr::LdLoc(1),   // 8
                Instr::LdInt(1),   // 9
                Instr::Add,        // 10
                Instr::StLoc(1),   // 11
                Instr::Br(0),      // 12
                Instr::Nop,        // 13
                Instr::Nop,        // 14
                Instr::LdLoc(0),   // 15
                Instr::Ret,        // 16
            ],
        );
        let method = static_method(vec![ParamInfo::new("n", HostType::i64())], HostType::i64(), body.clone());
        assert_eq!(verify(&body, MethodShape::of(&method), &no_calls), Ok(()));
        assert_eq!(run(&method, &mut [HostValue::Int(5)]).unwrap(), HostValue::Int(10));
    }

    #[test]
    fn test_step_limit() {
        let body = IlBody::new(vec![Instr::Br(0)]);
        let method = static_method(vec![], HostType::Void, body);
        let err = run(&method, &mut []).unwrap_err();
        assert_eq!(err.kind, "ExecutionEngineException");
    }

    #[test]
    fn test_starg_writes_back() {
        let body = IlBody::new(vec![Instr::LdStr("x".into()), Instr::StArg(0), Instr::Ret]);
        let method = static_method(vec![ParamInfo::new("s", HostType::String)], HostType::Void, body);
        let mut args = [HostValue::Null];
        run(&method, &mut args).unwrap();
        assert_eq!(args[0], HostValue::str("x"));
    }

    #[test]
    fn test_string_concat_and_throw() {
        let body = IlBody::new(vec![Instr::LdStr("n=".into()), Instr::LdInt(3), Instr::Add, Instr::Throw]);
        let method = static_method(vec![], HostType::Void, body);
        let err = run(&method, &mut []).unwrap_err();
        assert_eq!(err.message, "n=3");
    }

    #[test]
    fn test_verify_rejects_bad_bodies() {
        let shape = MethodShape {
            has_this: false,
            params: 1,
            returns_value: true,
        };
        let underflow = IlBody::new(vec![Instr::Add, Instr::Ret]);
        assert_eq!(verify(&underflow, shape, &no_calls), Err(VerifyError::StackUnderflow(0)));

        let bad_target = IlBody::new(vec![Instr::Br(9)]);
        assert!(matches!(
            verify(&bad_target, shape, &no_calls),
            Err(VerifyError::InvalidBranchTarget { target: 9, .. })
        ));

        let falls_off = IlBody::new(vec![Instr::LdArg(0), Instr::Pop]);
        assert_eq!(verify(&falls_off, shape, &no_calls), Err(VerifyError::FallOffEnd(1)));

        let bad_arg = IlBody::new(vec![Instr::LdArg(3), Instr::Ret]);
        assert!(matches!(
            verify(&bad_arg, shape, &no_calls),
            Err(VerifyError::InvalidArgRef { index: 3, .. })
        ));

        let no_this = IlBody::new(vec![Instr::LdThis, Instr::Ret]);
        assert_eq!(verify(&no_this, shape, &no_calls), Err(VerifyError::NoThis(0)));

        let unknown = IlBody::new(vec![Instr::Call(MethodToken(7)), Instr::LdNull, Instr::Ret]);
        assert!(matches!(
            verify(&unknown, shape, &no_calls),
            Err(VerifyError::UnknownToken { .. })
        ));

        let bad_ret = IlBody::new(vec![Instr::LdInt(1), Instr::LdInt(2), Instr::Ret]);
        assert_eq!(
            verify(&bad_ret, shape, &no_calls),
            Err(VerifyError::BadReturn { offset: 2, depth: 2 })
        );
    }

    #[test]
    fn test_verify_detects_depth_mismatch_at_join() {
        let shape = MethodShape {
            has_this: false,
            params: 1,
            returns_value: false,
        };
        // One path pushes a value before reaching index 3, the other does not
        let body = IlBody::new(vec![
            Instr::LdArg(0),
            Instr::BrTrue(3),
            Instr::LdInt(1),
            Instr::Ret,
        ]);
        assert!(matches!(
            verify(&body, shape, &no_calls),
            Err(VerifyError::StackMismatch { offset: 3, .. }) | Err(VerifyError::BadReturn { .. })
        ));
    }
}
