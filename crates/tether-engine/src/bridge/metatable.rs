//! Metatable protocol
//!
//! Every exposed host type gets two metatables in the VM:
//!
//! - the **instance** metatable, attached to object handles: member reads
//!   and writes, array elements, the `Item` indexer, `tostring`, and the
//!   finalizer that releases the handle;
//! - the **class** metatable, attached to the single class handle `import`
//!   returns: construction through `__call`, static fields, static
//!   properties and methods.
//!
//! Registration goes `Unregistered → Registering → Registered` once per type;
//! registering again returns the existing metatables.
//!
//! Method members are exposed as wrapper functions. A wrapper called with a
//! first argument that is an instance of the type makes an instance call
//! (`obj:Method(...)`); anything else is a static call (`Class.Method(...)`).

use std::rc::Rc;

use crate::bridge::dispatch::CallShape;
use crate::bridge::registry::{ObjectHandle, Resolved};
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{
    HostException, HostType, MethodKind, ObjectRef, TypeId, TypeInfo, CONSTRUCTOR_NAME, INDEXER_NAME,
};
use crate::vm::{FunctionRef, MetaKey, ScriptState, ScriptTag, ScriptValue};

/// Registration state of a host type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Metatables are being built
    Registering,
    /// Metatables are installed
    Registered(TypeMetatables),
}

/// Metatable keys of one exposed type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMetatables {
    /// Attached to object handles
    pub instance: MetaKey,
    /// Attached to the class handle
    pub class: MetaKey,
}

type MetaBody = fn(&Bridge, &mut ScriptState, TypeId, &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>>;

fn arg(args: &[ScriptValue], index: usize) -> ScriptValue {
    args.get(index).cloned().unwrap_or_default()
}

fn key_text(key: &ScriptValue) -> String {
    match key {
        ScriptValue::String(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ScriptValue::Number(n) => n.to_string(),
        other => other.tag().name().to_string(),
    }
}

fn first(mut results: Vec<ScriptValue>) -> ScriptValue {
    if results.is_empty() {
        ScriptValue::Nil
    } else {
        results.swap_remove(0)
    }
}

fn tags(args: &[ScriptValue]) -> Vec<ScriptTag> {
    args.iter().map(ScriptValue::tag).collect()
}

impl Bridge {
    /// Expose a host type to the VM, building its metatables on first use
    pub fn register(&self, vm: &mut ScriptState, ty: TypeId) -> BridgeResult<TypeMetatables> {
        self.owner.assert_owner();
        match self.exposed.borrow().get(&ty) {
            Some(Registration::Registered(metas)) => return Ok(*metas),
            Some(Registration::Registering) => {
                return Err(BridgeError::TypeNotFound(format!("#{} (registration in progress)", ty.0)))
            }
            None => {}
        }
        let info = self.type_info(ty)?;
        self.exposed.borrow_mut().insert(ty, Registration::Registering);

        let instance = vm.new_metatable(info.name.clone());
        let class = vm.new_metatable(format!("class {}", info.name));
        let instance_fns = [
            self.meta_fn("__index", ty, instance_index),
            self.meta_fn("__newindex", ty, instance_newindex),
            self.meta_fn("__tostring", ty, instance_tostring),
            self.meta_fn("__gc", ty, finalize),
        ];
        let class_fns = [
            self.meta_fn("__call", ty, class_call),
            self.meta_fn("__index", ty, class_index),
            self.meta_fn("__newindex", ty, class_newindex),
            self.meta_fn("__tostring", ty, class_tostring),
            self.meta_fn("__gc", ty, finalize),
        ];
        if let Some(meta) = vm.metatable_mut(instance) {
            let [index, newindex, tostring, gc] = instance_fns;
            meta.index = Some(index);
            meta.newindex = Some(newindex);
            meta.tostring = Some(tostring);
            meta.gc = Some(gc);
        }
        if let Some(meta) = vm.metatable_mut(class) {
            let [call, index, newindex, tostring, gc] = class_fns;
            meta.call = Some(call);
            meta.index = Some(index);
            meta.newindex = Some(newindex);
            meta.tostring = Some(tostring);
            meta.gc = Some(gc);
        }

        let metas = TypeMetatables { instance, class };
        self.exposed.borrow_mut().insert(ty, Registration::Registered(metas));
        log::debug!("registered {} (instance meta {}, class meta {})", info.name, instance, class);
        Ok(metas)
    }

    /// Registration state of a type
    pub fn registration(&self, ty: TypeId) -> Option<Registration> {
        self.exposed.borrow().get(&ty).copied()
    }

    /// The class handle of a type, created on first use
    pub fn class_value(&self, vm: &mut ScriptState, ty: TypeId) -> BridgeResult<ScriptValue> {
        if let Some(class) = self.classes.borrow().get(&ty) {
            return Ok(class.clone());
        }
        let metas = self.register(vm, ty)?;
        let handle = self.registry.borrow_mut().wrap_class(ty);
        let class = vm.new_userdata(handle.to_raw(), metas.class);
        self.classes.borrow_mut().insert(ty, class.clone());
        Ok(class)
    }

    /// `import(name)`
    pub fn import(&self, vm: &mut ScriptState, name: &str) -> BridgeResult<ScriptValue> {
        let ty = self
            .domain
            .lookup(name)
            .ok_or_else(|| BridgeError::TypeNotFound(name.to_string()))?;
        self.class_value(vm, ty)
    }

    pub(crate) fn type_info(&self, ty: TypeId) -> BridgeResult<Rc<TypeInfo>> {
        self.domain
            .get(ty)
            .ok_or_else(|| BridgeError::TypeNotFound(format!("#{}", ty.0)))
    }

    pub(crate) fn resolve_value(&self, value: &ScriptValue) -> BridgeResult<Resolved> {
        match value {
            ScriptValue::Handle(ud) => self.registry.borrow().resolve(ObjectHandle::from_raw(ud.slot())),
            other => Err(BridgeError::conversion("handle", other.tag().name())),
        }
    }

    fn object_of(&self, value: &ScriptValue) -> BridgeResult<ObjectRef> {
        match self.resolve_value(value)? {
            Resolved::Object(obj) => Ok(obj),
            Resolved::Class(_) => Err(BridgeError::conversion("object instance", "class")),
        }
    }

    fn instance_of(&self, value: &ScriptValue, ty: TypeId) -> Option<ObjectRef> {
        match self.resolve_value(value) {
            Ok(Resolved::Object(obj)) if self.domain.is_subtype(obj.type_id(), ty) => Some(obj),
            _ => None,
        }
    }

    fn meta_fn(&self, name: &str, ty: TypeId, body: MetaBody) -> FunctionRef {
        self.bridge_fn(name, move |bridge, vm, args| body(bridge, vm, ty, args))
    }

    // ========================================================================
    // Methods
    // ========================================================================

    /// Script function calling member `member` of `ty`, shared per type
    pub fn method_wrapper(&self, ty: TypeId, member: &str) -> BridgeResult<FunctionRef> {
        let key = (ty, member.to_string());
        if let Some(func) = self.wrappers.borrow().get(&key) {
            return Ok(func.clone());
        }
        let info = self.type_info(ty)?;
        let name = member.to_string();
        let func = self.bridge_fn(&format!("{}.{}", info.name, member), move |bridge, vm, args| {
            bridge.call_wrapped(vm, ty, &name, args)
        });
        self.wrappers.borrow_mut().insert(key, func.clone());
        Ok(func)
    }

    fn call_wrapped(
        &self,
        vm: &mut ScriptState,
        ty: TypeId,
        member: &str,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        if let Some(obj) = args.first().and_then(|a| self.instance_of(a, ty)) {
            let rest = &args[1..];
            return match self.resolve(obj.type_id(), member, CallShape::Instance, &tags(rest)) {
                Ok(method) => self.invoke_method(vm, &method, Some(obj), rest),
                Err(instance_err) => match self.resolve(ty, member, CallShape::Static, &tags(args)) {
                    Ok(method) => self.invoke_method(vm, &method, None, args),
                    Err(_) => Err(instance_err),
                },
            };
        }
        let method = self.resolve(ty, member, CallShape::Static, &tags(args))?;
        self.invoke_method(vm, &method, None, args)
    }

    // ========================================================================
    // Members
    // ========================================================================

    fn element_index(&self, obj: &ObjectRef, key: f64) -> BridgeResult<usize> {
        let len = obj.len();
        if key.fract() != 0.0 || key < 0.0 || key >= len as f64 {
            return Err(BridgeError::Host(HostException::new(
                "IndexOutOfRangeException",
                format!("index {} is outside the bounds of the array (length {})", key, len),
            )));
        }
        Ok(key as usize)
    }

    fn member_not_found(&self, ty: TypeId, key: &ScriptValue) -> BridgeError {
        BridgeError::MemberNotFound {
            type_name: self
                .domain
                .get(ty)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| format!("#{}", ty.0)),
            member: key_text(key),
        }
    }

    /// `obj[key]`
    pub fn get_member(&self, vm: &mut ScriptState, obj: &ObjectRef, key: &ScriptValue) -> BridgeResult<ScriptValue> {
        let ty = obj.type_id();
        let info = self.type_info(ty)?;
        if let (true, ScriptValue::Number(n)) = (info.is_array(), key) {
            let index = self.element_index(obj, *n)?;
            return self.to_script(vm, &obj.get(index).unwrap_or_default());
        }

        let chain = self.domain.chain(ty);
        if let Some(name) = key.as_str() {
            for t in &chain {
                if let Some(field) = t.field(name) {
                    let value = if field.is_static {
                        t.static_value(field.slot)
                    } else {
                        obj.get(field.slot)
                    };
                    return self.to_script(vm, &value.unwrap_or_default());
                }
                if let Some(getter) = t.property(name).and_then(|p| p.getter.clone()) {
                    let this = getter.has_this().then(|| Rc::clone(obj));
                    return Ok(first(self.invoke_method(vm, &getter, this, &[])?));
                }
                if t.has_method(name) {
                    return Ok(ScriptValue::Function(self.method_wrapper(ty, name)?));
                }
            }
        }

        let indexer = chain
            .iter()
            .find_map(|t| t.property(INDEXER_NAME).filter(|p| !p.is_static).and_then(|p| p.getter.clone()));
        match indexer {
            Some(getter) => Ok(first(self.invoke_method(vm, &getter, Some(Rc::clone(obj)), &[key.clone()])?)),
            None => Err(self.member_not_found(ty, key)),
        }
    }

    /// `obj[key] = value`
    pub fn set_member(
        &self,
        vm: &mut ScriptState,
        obj: &ObjectRef,
        key: &ScriptValue,
        value: &ScriptValue,
    ) -> BridgeResult<()> {
        let ty = obj.type_id();
        let info = self.type_info(ty)?;
        if let (true, ScriptValue::Number(n)) = (info.is_array(), key) {
            let index = self.element_index(obj, *n)?;
            let elem = info.element.clone().unwrap_or(HostType::Object);
            obj.set(index, self.to_host(value, &elem)?);
            return Ok(());
        }

        let chain = self.domain.chain(ty);
        if let Some(name) = key.as_str() {
            for t in &chain {
                if let Some(field) = t.field(name) {
                    let host = self.to_host(value, &field.ty)?;
                    if field.is_static {
                        t.set_static_value(field.slot, host);
                    } else {
                        obj.set(field.slot, host);
                    }
                    return Ok(());
                }
                if let Some(prop) = t.property(name) {
                    let setter = prop.setter.clone().ok_or_else(|| {
                        BridgeError::Host(HostException::new(
                            "MemberAccessException",
                            format!("property {}.{} has no setter", t.name, name),
                        ))
                    })?;
                    let this = setter.has_this().then(|| Rc::clone(obj));
                    self.invoke_method(vm, &setter, this, &[value.clone()])?;
                    return Ok(());
                }
            }
        }

        let indexer = chain
            .iter()
            .find_map(|t| t.property(INDEXER_NAME).filter(|p| !p.is_static).and_then(|p| p.setter.clone()));
        match indexer {
            Some(setter) => {
                self.invoke_method(vm, &setter, Some(Rc::clone(obj)), &[key.clone(), value.clone()])?;
                Ok(())
            }
            None => Err(self.member_not_found(ty, key)),
        }
    }

    fn get_static(&self, vm: &mut ScriptState, ty: TypeId, key: &ScriptValue) -> BridgeResult<ScriptValue> {
        if let Some(name) = key.as_str() {
            for t in self.domain.chain(ty) {
                if let Some(field) = t.field(name).filter(|f| f.is_static) {
                    return self.to_script(vm, &t.static_value(field.slot).unwrap_or_default());
                }
                if let Some(getter) = t.property(name).filter(|p| p.is_static).and_then(|p| p.getter.clone()) {
                    return Ok(first(self.invoke_method(vm, &getter, None, &[])?));
                }
                if t.has_method(name) {
                    return Ok(ScriptValue::Function(self.method_wrapper(ty, name)?));
                }
            }
        }
        Err(self.member_not_found(ty, key))
    }

    fn set_static(&self, vm: &mut ScriptState, ty: TypeId, key: &ScriptValue, value: &ScriptValue) -> BridgeResult<()> {
        if let Some(name) = key.as_str() {
            for t in self.domain.chain(ty) {
                if let Some(field) = t.field(name).filter(|f| f.is_static) {
                    let host = self.to_host(value, &field.ty)?;
                    t.set_static_value(field.slot, host);
                    return Ok(());
                }
                if let Some(setter) = t.property(name).filter(|p| p.is_static).and_then(|p| p.setter.clone()) {
                    self.invoke_method(vm, &setter, None, &[value.clone()])?;
                    return Ok(());
                }
            }
        }
        Err(self.member_not_found(ty, key))
    }

    fn describe(&self, vm: &mut ScriptState, obj: &ObjectRef, handle: ObjectHandle) -> BridgeResult<String> {
        let ty = obj.type_id();
        let to_string = self.domain.chain(ty).iter().find_map(|t| {
            t.methods_named("ToString")
                .find(|m| m.kind == MethodKind::Instance && m.input_arity() == 0 && m.ret == HostType::String)
                .cloned()
        });
        if let Some(method) = to_string {
            if let ScriptValue::String(text) = first(self.invoke_method(vm, &method, Some(Rc::clone(obj)), &[])?) {
                return Ok(String::from_utf8_lossy(&text).into_owned());
            }
        }
        Ok(format!("{}: {}", self.type_info(ty)?.name, handle))
    }
}

// ============================================================================
// Metamethods
// ============================================================================

fn instance_index(bridge: &Bridge, vm: &mut ScriptState, _: TypeId, args: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
    let obj = bridge.object_of(&arg(args, 0))?;
    Ok(vec![bridge.get_member(vm, &obj, &arg(args, 1))?])
}

fn instance_newindex(
    bridge: &Bridge,
    vm: &mut ScriptState,
    _: TypeId,
    args: &[ScriptValue],
) -> BridgeResult<Vec<ScriptValue>> {
    let obj = bridge.object_of(&arg(args, 0))?;
    bridge.set_member(vm, &obj, &arg(args, 1), &arg(args, 2))?;
    Ok(Vec::new())
}

fn instance_tostring(
    bridge: &Bridge,
    vm: &mut ScriptState,
    _: TypeId,
    args: &[ScriptValue],
) -> BridgeResult<Vec<ScriptValue>> {
    let target = arg(args, 0);
    let handle = match &target {
        ScriptValue::Handle(ud) => ObjectHandle::from_raw(ud.slot()),
        other => return Err(BridgeError::conversion("handle", other.tag().name())),
    };
    let obj = bridge.object_of(&target)?;
    Ok(vec![ScriptValue::from(bridge.describe(vm, &obj, handle)?)])
}

fn finalize(bridge: &Bridge, _: &mut ScriptState, _: TypeId, args: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
    if let ScriptValue::LightPointer(slot) = arg(args, 0) {
        let handle = ObjectHandle::from_raw(slot as u64);
        let mut registry = bridge.registry.borrow_mut();
        if registry.is_issued(handle) {
            registry.release(handle)?;
        }
    }
    Ok(Vec::new())
}

fn class_call(bridge: &Bridge, vm: &mut ScriptState, ty: TypeId, args: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
    let ctor_args = args.get(1..).unwrap_or(&[]);
    let mut results = bridge.call_member(vm, ty, CONSTRUCTOR_NAME, CallShape::Constructor, None, ctor_args)?;
    // Only the new instance; ref/out values of constructors are not surfaced
    results.truncate(1);
    Ok(results)
}

fn class_index(bridge: &Bridge, vm: &mut ScriptState, ty: TypeId, args: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
    Ok(vec![bridge.get_static(vm, ty, &arg(args, 1))?])
}

fn class_newindex(
    bridge: &Bridge,
    vm: &mut ScriptState,
    ty: TypeId,
    args: &[ScriptValue],
) -> BridgeResult<Vec<ScriptValue>> {
    bridge.set_static(vm, ty, &arg(args, 1), &arg(args, 2))?;
    Ok(Vec::new())
}

fn class_tostring(bridge: &Bridge, _: &mut ScriptState, ty: TypeId, _: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
    Ok(vec![ScriptValue::from(format!("class {}", bridge.type_info(ty)?.name))])
}
