//! Marshaling engine
//!
//! Conversion between script values and reflection-typed host values.
//!
//! | script tag    | host type                  | rule                                   |
//! |---------------|----------------------------|----------------------------------------|
//! | number        | numeric primitive          | range-checked; integers must be whole  |
//! | string        | `String`                   | raw byte copy                          |
//! | handle        | class/struct/array         | unwrap, then assignability check       |
//! | nil           | reference type             | null                                   |
//! | nil           | `out` slot                 | default of the slot type               |
//! | anything      | `System.Object`            | boxed as is (functions excepted)       |
//!
//! Host values going the other way become numbers, booleans, strings and
//! light pointers, or are wrapped into handles. Struct instances are copied
//! in both directions.
//!
//! Results of a call reach script in a fixed order: the return value (the new
//! object for constructors), then every ref/out parameter in declaration
//! order.

use crate::bridge::registry::{ObjectHandle, Ownership, Resolved};
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{
    HostType, HostValue, MethodInfo, MethodKind, NumericKind, ObjectRef, ParamInfo, ParamMode, TypeKind,
};
use crate::vm::{ScriptState, ScriptTag, ScriptValue};

/// Whether a script value with `tag` can be passed where `ty` is expected.
///
/// Handles are accepted everywhere here; their runtime type is checked when
/// the argument is actually converted.
pub fn tag_accepts(tag: ScriptTag, ty: &HostType) -> bool {
    match tag {
        ScriptTag::Handle => true,
        ScriptTag::Function => false,
        ScriptTag::Number => matches!(ty, HostType::Numeric(_) | HostType::Object),
        ScriptTag::Bool => matches!(ty, HostType::Bool | HostType::Object),
        ScriptTag::String => matches!(ty, HostType::String | HostType::Object),
        ScriptTag::LightPointer => matches!(ty, HostType::Pointer | HostType::Object),
        ScriptTag::Nil => matches!(
            ty,
            HostType::String | HostType::Object | HostType::Class(_) | HostType::Array(_)
        ),
    }
}

fn number_to_host(n: f64, kind: NumericKind) -> BridgeResult<HostValue> {
    let (lo, hi) = kind.bounds();
    let out_of_range = || BridgeError::conversion(kind.name(), format!("number {}", n));
    if kind.is_integer() {
        if !n.is_finite() || n.fract() != 0.0 || n < lo || n >= hi {
            return Err(out_of_range());
        }
        return Ok(if kind.is_unsigned() {
            HostValue::UInt(n as u64)
        } else {
            HostValue::Int(n as i64)
        });
    }
    match kind {
        NumericKind::F32 if n.is_finite() && (n < lo || n > hi) => Err(out_of_range()),
        NumericKind::F32 => Ok(HostValue::Float(n as f32 as f64)),
        _ => Ok(HostValue::Float(n)),
    }
}

impl Bridge {
    /// Convert a script value to a host value of type `ty`
    pub fn to_host(&self, value: &ScriptValue, ty: &HostType) -> BridgeResult<HostValue> {
        self.owner.assert_owner();
        let mismatch = || BridgeError::conversion(ty.to_string(), value.tag().name());
        match (value, ty) {
            (ScriptValue::Function(_), _) => Err(mismatch()),
            (ScriptValue::Handle(ud), _) => {
                let handle = ObjectHandle::from_raw(ud.slot());
                let obj = match self.registry.borrow().resolve(handle)? {
                    Resolved::Object(obj) => obj,
                    Resolved::Class(_) => return Err(BridgeError::conversion(ty.to_string(), "class")),
                };
                if !self.domain.accepts(ty, &obj) {
                    let got = self
                        .domain
                        .get(obj.type_id())
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|| "handle".to_string());
                    return Err(BridgeError::conversion(ty.to_string(), got));
                }
                Ok(HostValue::Object(self.copy_if_value_type(obj)))
            }
            (ScriptValue::Nil, HostType::Class(name)) => match self.domain.lookup(name) {
                Some(id) if self.domain.get(id).map(|t| t.is_value_type()).unwrap_or(false) => Err(mismatch()),
                _ => Ok(HostValue::Null),
            },
            (ScriptValue::Nil, HostType::String | HostType::Object | HostType::Array(_)) => Ok(HostValue::Null),
            (ScriptValue::Nil, _) => Err(mismatch()),
            (ScriptValue::Number(n), HostType::Numeric(kind)) => number_to_host(*n, *kind),
            (ScriptValue::Number(n), HostType::Object) => Ok(HostValue::Float(*n)),
            (ScriptValue::Bool(b), HostType::Bool | HostType::Object) => Ok(HostValue::Bool(*b)),
            (ScriptValue::String(s), HostType::String | HostType::Object) => Ok(HostValue::Str(s.clone())),
            (ScriptValue::LightPointer(p), HostType::Pointer | HostType::Object) => Ok(HostValue::Pointer(*p)),
            _ => Err(mismatch()),
        }
    }

    /// Convert a value destined for a parameter slot
    pub fn to_host_param(&self, value: &ScriptValue, param: &ParamInfo) -> BridgeResult<HostValue> {
        self.to_host_slot(value, &param.ty, param.mode)
    }

    /// Convert a value for a slot with an explicit passing mode.
    ///
    /// nil in an `out` slot becomes the default of the slot type.
    pub fn to_host_slot(&self, value: &ScriptValue, ty: &HostType, mode: ParamMode) -> BridgeResult<HostValue> {
        if mode == ParamMode::Out && value.is_nil() {
            return Ok(HostValue::default_for(ty));
        }
        self.to_host(value, ty)
    }

    /// Convert a host value to a script value, wrapping objects as strong
    /// handles
    pub fn to_script(&self, vm: &mut ScriptState, value: &HostValue) -> BridgeResult<ScriptValue> {
        self.owner.assert_owner();
        Ok(match value {
            HostValue::Null => ScriptValue::Nil,
            HostValue::Bool(b) => ScriptValue::Bool(*b),
            HostValue::Int(i) => ScriptValue::Number(*i as f64),
            HostValue::UInt(u) => ScriptValue::Number(*u as f64),
            HostValue::Float(f) => ScriptValue::Number(*f),
            HostValue::Str(s) => ScriptValue::String(s.clone()),
            HostValue::Pointer(p) => ScriptValue::LightPointer(*p),
            HostValue::Object(obj) => {
                let obj = self.copy_if_value_type(obj.clone());
                self.push_object(vm, &obj, Ownership::Strong)?
            }
        })
    }

    /// Wrap a host-owned object as a weak handle; it goes stale when the
    /// host drops the object
    pub fn to_script_weak(&self, vm: &mut ScriptState, obj: &ObjectRef) -> BridgeResult<ScriptValue> {
        self.owner.assert_owner();
        self.push_object(vm, obj, Ownership::Weak)
    }

    fn push_object(&self, vm: &mut ScriptState, obj: &ObjectRef, ownership: Ownership) -> BridgeResult<ScriptValue> {
        let metas = self.register(vm, obj.type_id())?;
        let handle = self.registry.borrow_mut().wrap(obj, ownership);
        Ok(vm.new_userdata(handle.to_raw(), metas.instance))
    }

    fn copy_if_value_type(&self, obj: ObjectRef) -> ObjectRef {
        match self.domain.get(obj.type_id()) {
            Some(ty) if ty.kind == TypeKind::Struct => obj.duplicate(),
            _ => obj,
        }
    }

    /// Convert call arguments for `method`.
    ///
    /// `args` holds one script value per input parameter; `out` parameters
    /// are not supplied by script and start at their default.
    pub fn marshal_args(&self, method: &MethodInfo, args: &[ScriptValue]) -> BridgeResult<Vec<HostValue>> {
        let mut supplied = args.iter();
        let mut out = Vec::with_capacity(method.params.len());
        for param in &method.params {
            let value = if param.is_input() {
                match supplied.next() {
                    Some(v) => self.to_host_param(v, param)?,
                    None => self.to_host_param(&ScriptValue::Nil, param)?,
                }
            } else {
                HostValue::default_for(&param.ty)
            };
            out.push(value);
        }
        Ok(out)
    }

    /// Script-visible results of a finished call: the return value, then
    /// every ref/out parameter in declaration order
    pub fn marshal_results(
        &self,
        vm: &mut ScriptState,
        method: &MethodInfo,
        ret: &HostValue,
        args: &[HostValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        let mut results = Vec::with_capacity(1 + args.len());
        if method.returns_value() || method.kind == MethodKind::Constructor {
            results.push(self.to_script(vm, ret)?);
        }
        for (param, value) in method.params.iter().zip(args) {
            if param.is_by_ref() {
                results.push(self.to_script(vm, value)?);
            }
        }
        Ok(results)
    }
}
