//! Type domain and builders
//!
//! A [`TypeDomain`] is the set of host types one VM instance can see. Types
//! are defined once and never change afterwards; descriptors are handed out
//! as shared references, so no borrow of the domain is held while a method
//! runs.
//!
//! Types are defined with fluent builders:
//!
//! ```text
//! TypeBuilder::class("Game.Counter")
//!     .field("hits", HostType::i32())
//!     .method(MethodBuilder::constructor())
//!     .method(MethodBuilder::method("Next").returns(HostType::i32()).native(...))
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::host::call::Invocation;
use crate::host::il::{IlBody, VerifyError};
use crate::host::meta::{
    FieldInfo, HostException, MethodBody, MethodInfo, PropertyInfo, TypeInfo, INDEXER_NAME,
};
use crate::host::object::{HostObject, HostValue, ObjectRef, TypeId};
use crate::host::types::{
    HostType, MethodKind, MethodToken, ParamInfo, ParamMode, TypeKind, CONSTRUCTOR_NAME,
};

/// Name of the root type
pub const ROOT_TYPE_NAME: &str = "System.Object";

/// Errors raised while defining types or loading images
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    /// A type with this name already exists
    #[error("Type `{0}` is already defined")]
    DuplicateType(String),

    /// Referenced type does not exist
    #[error("Type `{0}` not found")]
    UnknownType(String),

    /// Explicit method token collides with an existing method
    #[error("Method token {0} is already in use")]
    DuplicateToken(MethodToken),

    /// Malformed definition
    #[error("Invalid definition: {0}")]
    Invalid(String),

    /// A method body failed verification
    #[error("{signature}: {source}")]
    Verify {
        /// Signature of the offending method
        signature: String,
        /// Verifier error
        #[source]
        source: VerifyError,
    },
}

#[derive(Default)]
struct DomainState {
    types: Vec<Rc<TypeInfo>>,
    by_name: FxHashMap<String, TypeId>,
    methods: FxHashMap<MethodToken, Arc<MethodInfo>>,
    arrays: FxHashMap<HostType, TypeId>,
    next_token: u32,
}

/// The host types visible to one VM instance.
pub struct TypeDomain {
    state: RefCell<DomainState>,
}

impl TypeDomain {
    /// Create a domain containing only the root type
    pub fn new() -> Self {
        let domain = Self {
            state: RefCell::new(DomainState {
                next_token: 1,
                ..DomainState::default()
            }),
        };
        let root = TypeInfo {
            id: TypeId(0),
            name: ROOT_TYPE_NAME.to_string(),
            base: None,
            kind: TypeKind::Class,
            element: None,
            fields: Vec::new(),
            properties: Vec::new(),
            constructors: Vec::new(),
            methods: Vec::new(),
            instance_slots: 0,
            layout: Vec::new(),
            statics: RefCell::new(Vec::new()),
        };
        {
            let mut state = domain.state.borrow_mut();
            state.by_name.insert(root.name.clone(), root.id);
            state.types.push(Rc::new(root));
        }
        domain
    }

    /// The root type
    pub fn root(&self) -> TypeId {
        TypeId(0)
    }

    /// Look up a type by fully qualified name
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.state.borrow().by_name.get(name).copied()
    }

    /// Type descriptor
    pub fn get(&self, id: TypeId) -> Option<Rc<TypeInfo>> {
        self.state.borrow().types.get(id.0 as usize).cloned()
    }

    /// Method descriptor by runtime token
    pub fn method(&self, token: MethodToken) -> Option<Arc<MethodInfo>> {
        self.state.borrow().methods.get(&token).cloned()
    }

    /// Every defined type, in definition order
    pub fn types(&self) -> Vec<Rc<TypeInfo>> {
        self.state.borrow().types.clone()
    }

    /// Number of defined types
    pub fn len(&self) -> usize {
        self.state.borrow().types.len()
    }

    /// Whether only the root exists
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// `ty` followed by its base types, ending at the root
    pub fn chain(&self, ty: TypeId) -> Vec<Rc<TypeInfo>> {
        let mut out = Vec::new();
        let mut current = self.get(ty);
        while let Some(info) = current {
            current = info.base.and_then(|b| self.get(b));
            out.push(info);
        }
        out
    }

    /// Whether `sub` is `sup` or derives from it
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        self.chain(sub).iter().any(|t| t.id == sup)
    }

    /// Whether an object can be stored in a slot of type `ty`
    pub fn accepts(&self, ty: &HostType, obj: &HostObject) -> bool {
        match ty {
            HostType::Object => true,
            HostType::Class(name) => match self.lookup(name) {
                Some(expected) => self.is_subtype(obj.type_id(), expected),
                None => false,
            },
            HostType::Array(_) => self.state.borrow().arrays.get(ty) == Some(&obj.type_id()),
            _ => false,
        }
    }

    /// Reserve `count` consecutive method tokens, returning the first
    pub fn reserve_tokens(&self, count: u32) -> u32 {
        let mut state = self.state.borrow_mut();
        let first = state.next_token;
        state.next_token += count;
        first
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Allocate an instance of `ty` with every field at its default
    pub fn instantiate(&self, ty: TypeId) -> Result<ObjectRef, HostException> {
        let info = self
            .get(ty)
            .ok_or_else(|| HostException::new("TypeLoadException", format!("no type {}", ty.0)))?;
        if info.is_array() {
            return Err(HostException::new(
                "MissingMethodException",
                format!("{} cannot be constructed", info.name),
            ));
        }
        let slots = info.layout.iter().map(HostValue::default_for).collect();
        Ok(HostObject::new(ty, slots))
    }

    /// Array type with element type `elem`, created on first use
    pub fn array_type(&self, elem: &HostType) -> TypeId {
        let key = HostType::array(elem.clone());
        if let Some(id) = self.state.borrow().arrays.get(&key) {
            return *id;
        }
        let mut state = self.state.borrow_mut();
        let id = TypeId(state.types.len() as u32);
        let info = TypeInfo {
            id,
            name: key.to_string(),
            base: Some(TypeId(0)),
            kind: TypeKind::Array,
            element: Some(elem.clone()),
            fields: Vec::new(),
            properties: Vec::new(),
            constructors: Vec::new(),
            methods: Vec::new(),
            instance_slots: 0,
            layout: Vec::new(),
            statics: RefCell::new(Vec::new()),
        };
        state.by_name.insert(info.name.clone(), id);
        state.arrays.insert(key, id);
        state.types.push(Rc::new(info));
        id
    }

    /// Allocate an array of `elem` holding `values`
    pub fn new_array(&self, elem: &HostType, values: Vec<HostValue>) -> ObjectRef {
        let ty = self.array_type(elem);
        HostObject::new(ty, values)
    }

    // ========================================================================
    // Definition
    // ========================================================================

    /// Define a type.
    ///
    /// Fields are laid out after the base type's fields. Methods named
    /// `get_X`/`set_X` also define property `X`.
    pub fn define(&self, builder: TypeBuilder) -> Result<TypeId, DomainError> {
        if builder.name.is_empty() {
            return Err(DomainError::Invalid("type name is empty".to_string()));
        }
        if self.lookup(&builder.name).is_some() {
            return Err(DomainError::DuplicateType(builder.name));
        }
        let base_id = match &builder.base {
            Some(name) => self
                .lookup(name)
                .ok_or_else(|| DomainError::UnknownType(name.clone()))?,
            None => self.root(),
        };
        let base = self
            .get(base_id)
            .ok_or_else(|| DomainError::UnknownType(ROOT_TYPE_NAME.to_string()))?;
        if base.is_array() {
            return Err(DomainError::Invalid(format!("{} cannot derive from an array", builder.name)));
        }

        let id = TypeId(self.state.borrow().types.len() as u32);
        let mut layout = base.layout.clone();
        let mut fields = Vec::with_capacity(builder.fields.len());
        let mut statics = Vec::new();
        for decl in builder.fields {
            let slot = if decl.is_static {
                statics.push(HostValue::default_for(&decl.ty));
                statics.len() - 1
            } else {
                layout.push(decl.ty.clone());
                layout.len() - 1
            };
            fields.push(FieldInfo {
                name: decl.name,
                ty: decl.ty,
                slot,
                is_static: decl.is_static,
            });
        }

        let mut constructors = Vec::new();
        let mut methods = Vec::new();
        let mut assigned = Vec::with_capacity(builder.methods.len());
        for mb in builder.methods {
            let token = self.assign_token(mb.token, &assigned)?;
            assigned.push(token);
            let info = Arc::new(MethodInfo {
                token,
                declaring: id,
                declaring_name: builder.name.clone(),
                name: mb.name,
                kind: mb.kind,
                params: mb.params,
                ret: if mb.kind == MethodKind::Constructor {
                    HostType::Void
                } else {
                    mb.ret
                },
                body: mb.body,
            });
            if info.name.is_empty() {
                return Err(DomainError::Invalid(format!("unnamed method on {}", builder.name)));
            }
            if info.kind == MethodKind::Constructor {
                constructors.push(info);
            } else {
                methods.push(info);
            }
        }
        let properties = derive_properties(&methods);

        let info = TypeInfo {
            id,
            name: builder.name,
            base: Some(base_id),
            kind: builder.kind,
            element: None,
            fields,
            properties,
            constructors,
            methods,
            instance_slots: layout.len(),
            layout,
            statics: RefCell::new(statics),
        };

        let mut state = self.state.borrow_mut();
        for m in info.constructors.iter().chain(&info.methods) {
            state.methods.insert(m.token, Arc::clone(m));
            state.next_token = state.next_token.max(m.token.0 + 1);
        }
        log::debug!(
            "defined type {} ({} fields, {} methods)",
            info.name,
            info.fields.len(),
            info.methods.len() + info.constructors.len()
        );
        state.by_name.insert(info.name.clone(), id);
        state.types.push(Rc::new(info));
        Ok(id)
    }

    fn assign_token(
        &self,
        explicit: Option<MethodToken>,
        pending: &[MethodToken],
    ) -> Result<MethodToken, DomainError> {
        match explicit {
            Some(token) => {
                if self.method(token).is_some() || pending.contains(&token) {
                    return Err(DomainError::DuplicateToken(token));
                }
                Ok(token)
            }
            None => {
                let mut state = self.state.borrow_mut();
                while state.methods.contains_key(&MethodToken(state.next_token))
                    || pending.contains(&MethodToken(state.next_token))
                {
                    state.next_token += 1;
                }
                let token = MethodToken(state.next_token);
                state.next_token += 1;
                Ok(token)
            }
        }
    }
}

impl Default for TypeDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TypeDomain")
            .field("types", &state.types.len())
            .field("methods", &state.methods.len())
            .finish()
    }
}

fn derive_properties(methods: &[Arc<MethodInfo>]) -> Vec<PropertyInfo> {
    let mut properties: Vec<PropertyInfo> = Vec::new();
    for m in methods {
        let (name, is_getter) = if let Some(name) = m.name.strip_prefix("get_") {
            (name, true)
        } else if let Some(name) = m.name.strip_prefix("set_") {
            (name, false)
        } else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let index_params = usize::from(name == INDEXER_NAME);
        let expected = if is_getter { index_params } else { index_params + 1 };
        if m.params.len() != expected {
            continue;
        }
        let ty = if is_getter {
            m.ret.clone()
        } else {
            m.params[expected - 1].ty.clone()
        };
        let is_static = m.kind == MethodKind::Static;
        let index = match properties.iter().position(|p| p.name == name && p.is_static == is_static) {
            Some(existing) => existing,
            None => {
                properties.push(PropertyInfo {
                    name: name.to_string(),
                    ty,
                    is_static,
                    getter: None,
                    setter: None,
                });
                properties.len() - 1
            }
        };
        let entry = &mut properties[index];
        let slot = if is_getter { &mut entry.getter } else { &mut entry.setter };
        if slot.is_none() {
            *slot = Some(Arc::clone(m));
        }
    }
    properties
}

// ============================================================================
// Builders
// ============================================================================

struct FieldDecl {
    name: String,
    ty: HostType,
    is_static: bool,
}

/// Fluent builder for a host type.
pub struct TypeBuilder {
    name: String,
    base: Option<String>,
    kind: TypeKind,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodBuilder>,
}

impl TypeBuilder {
    /// Reference type
    pub fn class(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            kind: TypeKind::Class,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Value type
    pub fn value_type(name: impl Into<String>) -> Self {
        Self {
            kind: TypeKind::Struct,
            ..Self::class(name)
        }
    }

    /// Derive from a named base type
    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.base = Some(name.into());
        self
    }

    /// Add an instance field
    pub fn field(mut self, name: impl Into<String>, ty: HostType) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            ty,
            is_static: false,
        });
        self
    }

    /// Add a static field
    pub fn static_field(mut self, name: impl Into<String>, ty: HostType) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            ty,
            is_static: true,
        });
        self
    }

    /// Add a constructor or method
    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.methods.push(method);
        self
    }
}

/// Fluent builder for a constructor or method.
pub struct MethodBuilder {
    name: String,
    kind: MethodKind,
    params: Vec<ParamInfo>,
    ret: HostType,
    body: MethodBody,
    token: Option<MethodToken>,
}

impl MethodBuilder {
    /// Instance method returning `Void` with no body
    pub fn method(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Instance,
            params: Vec::new(),
            ret: HostType::Void,
            body: MethodBody::Abstract,
            token: None,
        }
    }

    /// Constructor whose body does nothing beyond allocation
    pub fn constructor() -> Self {
        Self {
            kind: MethodKind::Constructor,
            body: MethodBody::Native(Arc::new(|_| Ok(HostValue::Null))),
            ..Self::method(CONSTRUCTOR_NAME)
        }
    }

    /// Make the method static
    pub fn static_(mut self) -> Self {
        self.kind = MethodKind::Static;
        self
    }

    /// Add a by-value parameter
    pub fn param(mut self, name: impl Into<String>, ty: HostType) -> Self {
        self.params.push(ParamInfo::new(name, ty));
        self
    }

    /// Add a `ref` parameter
    pub fn param_ref(mut self, name: impl Into<String>, ty: HostType) -> Self {
        self.params.push(ParamInfo::with_mode(name, ty, ParamMode::Ref));
        self
    }

    /// Add an `out` parameter
    pub fn param_out(mut self, name: impl Into<String>, ty: HostType) -> Self {
        self.params.push(ParamInfo::with_mode(name, ty, ParamMode::Out));
        self
    }

    /// Add a parameter descriptor
    pub fn param_info(mut self, param: ParamInfo) -> Self {
        self.params.push(param);
        self
    }

    /// Set the return type
    pub fn returns(mut self, ty: HostType) -> Self {
        self.ret = ty;
        self
    }

    /// Implement with a Rust closure
    pub fn native(
        mut self,
        f: impl Fn(&mut Invocation<'_>) -> Result<HostValue, HostException> + Send + Sync + 'static,
    ) -> Self {
        self.body = MethodBody::Native(Arc::new(f));
        self
    }

    /// Implement with an IL body
    pub fn il(mut self, body: IlBody) -> Self {
        self.body = MethodBody::Il(body);
        self
    }

    /// Make this method the runtime patch hub
    pub fn patch_hub(mut self) -> Self {
        self.body = MethodBody::PatchHub;
        self
    }

    pub(crate) fn kind(mut self, kind: MethodKind) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn with_token(mut self, token: MethodToken) -> Self {
        self.token = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes() -> TypeDomain {
        let domain = TypeDomain::new();
        domain
            .define(
                TypeBuilder::class("Geo.Shape")
                    .field("id", HostType::i32())
                    .static_field("count", HostType::i32())
                    .method(MethodBuilder::constructor())
                    .method(MethodBuilder::method("get_Area").returns(HostType::f64()))
                    .method(
                        MethodBuilder::method("get_Item")
                            .param("i", HostType::i32())
                            .returns(HostType::String),
                    ),
            )
            .unwrap();
        domain
            .define(
                TypeBuilder::class("Geo.Circle")
                    .base("Geo.Shape")
                    .field("radius", HostType::f64())
                    .method(MethodBuilder::constructor()),
            )
            .unwrap();
        domain
    }

    #[test]
    fn test_inherited_layout() {
        let domain = shapes();
        let circle = domain.get(domain.lookup("Geo.Circle").unwrap()).unwrap();
        assert_eq!(circle.instance_slots, 2);
        assert_eq!(circle.field("radius").unwrap().slot, 1);
        let obj = domain.instantiate(circle.id).unwrap();
        assert_eq!(obj.get(0), Some(HostValue::Int(0)));
        assert_eq!(obj.get(1), Some(HostValue::Float(0.0)));
    }

    #[test]
    fn test_subtyping_and_accepts() {
        let domain = shapes();
        let shape = domain.lookup("Geo.Shape").unwrap();
        let circle = domain.lookup("Geo.Circle").unwrap();
        assert!(domain.is_subtype(circle, shape));
        assert!(!domain.is_subtype(shape, circle));
        let obj = domain.instantiate(circle).unwrap();
        assert!(domain.accepts(&HostType::class("Geo.Shape"), &obj));
        assert!(domain.accepts(&HostType::Object, &obj));
        assert!(!domain.accepts(&HostType::String, &obj));
        assert_eq!(domain.chain(circle).len(), 3);
    }

    #[test]
    fn test_properties_from_accessors() {
        let domain = shapes();
        let shape = domain.get(domain.lookup("Geo.Shape").unwrap()).unwrap();
        let area = shape.property("Area").unwrap();
        assert_eq!(area.ty, HostType::f64());
        assert!(area.getter.is_some() && area.setter.is_none());
        assert_eq!(shape.property(INDEXER_NAME).unwrap().ty, HostType::String);
        assert_eq!(shape.field("count").unwrap().slot, 0);
        assert_eq!(shape.static_value(0), Some(HostValue::Int(0)));
    }

    #[test]
    fn test_array_types_are_interned() {
        let domain = TypeDomain::new();
        let a = domain.array_type(&HostType::i32());
        let b = domain.array_type(&HostType::i32());
        assert_eq!(a, b);
        assert_eq!(domain.get(a).unwrap().name, "Int32[]");
        let arr = domain.new_array(&HostType::i32(), vec![HostValue::Int(1)]);
        assert!(domain.accepts(&HostType::array(HostType::i32()), &arr));
        assert!(!domain.accepts(&HostType::array(HostType::f64()), &arr));
    }

    #[test]
    fn test_duplicate_and_unknown_types() {
        let domain = shapes();
        assert_eq!(
            domain.define(TypeBuilder::class("Geo.Shape")).unwrap_err(),
            DomainError::DuplicateType("Geo.Shape".into())
        );
        assert_eq!(
            domain.define(TypeBuilder::class("X").base("Nope")).unwrap_err(),
            DomainError::UnknownType("Nope".into())
        );
    }

    #[test]
    fn test_explicit_tokens() {
        let domain = TypeDomain::new();
        domain
            .define(TypeBuilder::class("A").method(MethodBuilder::method("M").with_token(MethodToken(40))))
            .unwrap();
        assert!(domain.method(MethodToken(40)).is_some());
        let err = domain
            .define(TypeBuilder::class("B").method(MethodBuilder::method("M").with_token(MethodToken(40))))
            .unwrap_err();
        assert_eq!(err, DomainError::DuplicateToken(MethodToken(40)));
    }
}
