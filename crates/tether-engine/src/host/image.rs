//! Compiled images
//!
//! An image is the unit the injector rewrites: type definitions plus method
//! definitions with IL bodies, serialized as JSON. Method tokens are local to
//! the image; loading an image into a [`TypeDomain`] assigns fresh runtime
//! tokens and rewrites every token operand to match.

use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::host::call::{hub_params, is_hub_shape};
use crate::host::domain::{DomainError, MethodBuilder, TypeBuilder, TypeDomain};
use crate::host::il::{verify, CallEffect, IlBody, MethodShape, VerifyError};
use crate::host::object::TypeId;
use crate::host::types::{
    signature, HostType, MethodKind, MethodToken, ParamInfo, ParamMode, TypeKind, CONSTRUCTOR_NAME,
};

/// Errors reading, writing, or validating an image
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// JSON encoding or decoding failed
    #[error("Malformed image: {0}")]
    Json(#[from] serde_json::Error),

    /// File access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid image
    #[error("Invalid image: {0}")]
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

    /// Loading into a domain failed
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: HostType,
    /// Static field
    #[serde(default)]
    pub is_static: bool,
}

/// Type definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Fully qualified name
    pub name: String,
    /// Base type name (root when absent)
    #[serde(default)]
    pub base: Option<String>,
    /// Class or struct
    #[serde(default)]
    pub kind: TypeKind,
    /// Fields, declaration order
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl TypeDef {
    /// Class definition
    pub fn class(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            kind: TypeKind::Class,
            fields: Vec::new(),
        }
    }

    /// Set the base type
    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.base = Some(name.into());
        self
    }

    /// Add an instance field
    pub fn field(mut self, name: impl Into<String>, ty: HostType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
            is_static: false,
        });
        self
    }
}

/// Method attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodAttrs {
    /// Target of the hot-patch injector
    #[serde(default)]
    pub patchable: bool,
    /// The designated patch hub
    #[serde(default)]
    pub patch_hub: bool,
    /// Body already carries an injected prologue
    #[serde(default)]
    pub injected: bool,
}

fn void() -> HostType {
    HostType::Void
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Image-local token
    pub token: MethodToken,
    /// Declaring type name
    pub declaring: String,
    /// Member name
    pub name: String,
    /// Constructor, instance, or static
    pub kind: MethodKind,
    /// Parameters
    #[serde(default)]
    pub params: Vec<ParamInfo>,
    /// Return type
    #[serde(default = "void")]
    pub ret: HostType,
    /// Attributes
    #[serde(default)]
    pub attrs: MethodAttrs,
    /// IL body (absent for the hub and abstract methods)
    #[serde(default)]
    pub body: Option<IlBody>,
}

impl MethodDef {
    /// Instance method returning `Void`
    pub fn method(declaring: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token: MethodToken(0),
            declaring: declaring.into(),
            name: name.into(),
            kind: MethodKind::Instance,
            params: Vec::new(),
            ret: HostType::Void,
            attrs: MethodAttrs::default(),
            body: None,
        }
    }

    /// Constructor
    pub fn constructor(declaring: impl Into<String>) -> Self {
        Self {
            kind: MethodKind::Constructor,
            ..Self::method(declaring, CONSTRUCTOR_NAME)
        }
    }

    /// Patch hub with the canonical hub signature
    pub fn patch_hub(declaring: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: MethodKind::Static,
            params: hub_params(),
            ret: HostType::Bool,
            attrs: MethodAttrs {
                patch_hub: true,
                ..MethodAttrs::default()
            },
            ..Self::method(declaring, name)
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

    /// Set the return type
    pub fn returns(mut self, ty: HostType) -> Self {
        self.ret = ty;
        self
    }

    /// Mark as a hot-patch target
    pub fn patchable(mut self) -> Self {
        self.attrs.patchable = true;
        self
    }

    /// Set the IL body
    pub fn body(mut self, body: IlBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Textual signature
    pub fn signature(&self) -> String {
        signature(&self.declaring, &self.name, &self.params)
    }

    /// Whether `Ret` pops a value
    pub fn returns_value(&self) -> bool {
        self.kind != MethodKind::Constructor && !self.ret.is_void()
    }

    /// Verifier view of this method's own frame
    pub fn shape(&self) -> MethodShape {
        MethodShape {
            has_this: self.kind != MethodKind::Static,
            params: self.params.len(),
            returns_value: self.returns_value(),
        }
    }

    /// Verifier view of a call to this method
    pub fn call_effect(&self) -> CallEffect {
        CallEffect {
            params: self.params.len(),
            has_this: self.kind == MethodKind::Instance,
            returns_value: self.returns_value(),
            constructor: self.kind == MethodKind::Constructor,
        }
    }
}

/// A compiled image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Image name
    pub name: String,
    /// Type definitions, in load order
    #[serde(default)]
    pub types: Vec<TypeDef>,
    /// Method definitions
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl Image {
    /// Empty image
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Add a type definition
    pub fn add_type(&mut self, ty: TypeDef) -> &mut Self {
        self.types.push(ty);
        self
    }

    /// Token the next [`add_method`](Self::add_method) call will assign
    pub fn next_token(&self) -> MethodToken {
        MethodToken(self.methods.iter().map(|m| m.token.0).max().unwrap_or(0) + 1)
    }

    /// Add a method definition, assigning it a fresh token
    pub fn add_method(&mut self, mut method: MethodDef) -> MethodToken {
        let token = self.next_token();
        method.token = token;
        self.methods.push(method);
        token
    }

    /// Method by token
    pub fn method(&self, token: MethodToken) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.token == token)
    }

    /// Method by token, for modification
    pub fn method_mut(&mut self, token: MethodToken) -> Option<&mut MethodDef> {
        self.methods.iter_mut().find(|m| m.token == token)
    }

    /// Method by signature string
    pub fn find_signature(&self, sig: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.signature() == sig)
    }

    /// Every method marked as the patch hub
    pub fn hubs(&self) -> Vec<&MethodDef> {
        self.methods.iter().filter(|m| m.attrs.patch_hub).collect()
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read an image file
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Write an image file
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// SHA-256 of the serialized image, hex encoded
    pub fn digest(&self) -> Result<String, ImageError> {
        let bytes = self.to_bytes()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check structure and verify every method body
    pub fn verify(&self) -> Result<(), ImageError> {
        let mut type_names = FxHashSet::default();
        for ty in &self.types {
            if !type_names.insert(ty.name.as_str()) {
                return Err(ImageError::Invalid(format!("type {} defined twice", ty.name)));
            }
            if ty.kind == TypeKind::Array {
                return Err(ImageError::Invalid(format!("{} cannot be defined as an array", ty.name)));
            }
        }

        let mut effects: FxHashMap<MethodToken, CallEffect> = FxHashMap::default();
        for m in &self.methods {
            if effects.insert(m.token, m.call_effect()).is_some() {
                return Err(ImageError::Invalid(format!("token {} used twice", m.token)));
            }
            if !type_names.contains(m.declaring.as_str()) {
                return Err(ImageError::Invalid(format!(
                    "{} declared on unknown type {}",
                    m.signature(),
                    m.declaring
                )));
            }
            if m.attrs.patch_hub && !is_hub_shape(m.kind, &m.params, &m.ret) {
                return Err(ImageError::Invalid(format!(
                    "{} does not have the patch hub signature",
                    m.signature()
                )));
            }
            if m.attrs.injected && m.body.is_none() {
                return Err(ImageError::Invalid(format!("{} is injected but has no body", m.signature())));
            }
        }

        let resolve = |token: MethodToken| effects.get(&token).copied();
        for m in &self.methods {
            if let Some(body) = &m.body {
                verify(body, m.shape(), &resolve).map_err(|source| ImageError::Verify {
                    signature: m.signature(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

impl TypeDomain {
    /// Load an image, returning the ids of its types in image order.
    ///
    /// The image is verified first. Image-local tokens are replaced by fresh
    /// runtime tokens in method identities and in every token operand. Every
    /// check runs before the first type is defined, so a rejected image
    /// leaves the domain untouched.
    pub fn load_image(&self, image: &Image) -> Result<Vec<TypeId>, ImageError> {
        image.verify()?;
        let order = self.definition_order(image)?;

        let first = self.reserve_tokens(image.methods.len() as u32);
        let remap: FxHashMap<MethodToken, MethodToken> = image
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.token, MethodToken(first + i as u32)))
            .collect();

        let mut builders = Vec::with_capacity(order.len());
        for &index in &order {
            builders.push((index, type_builder(&image.types[index], image, &remap)?));
        }

        let mut ids = vec![self.root(); image.types.len()];
        for (index, builder) in builders {
            ids[index] = self.define(builder)?;
        }
        log::debug!(
            "loaded image {} ({} types, {} methods)",
            image.name,
            image.types.len(),
            image.methods.len()
        );
        Ok(ids)
    }

    /// Indices of the image's types with every base ahead of its subtypes.
    ///
    /// Fails when a type name is already taken, or a base is neither in the
    /// image nor a non-array type of this domain, or bases form a cycle.
    fn definition_order(&self, image: &Image) -> Result<Vec<usize>, ImageError> {
        let local: FxHashMap<&str, usize> =
            image.types.iter().enumerate().map(|(i, ty)| (ty.name.as_str(), i)).collect();
        for ty in &image.types {
            if ty.name.is_empty() {
                return Err(DomainError::Invalid("type name is empty".to_string()).into());
            }
            if self.lookup(&ty.name).is_some() {
                return Err(DomainError::DuplicateType(ty.name.clone()).into());
            }
            let Some(base) = &ty.base else { continue };
            if local.contains_key(base.as_str()) {
                continue;
            }
            match self.lookup(base).and_then(|id| self.get(id)) {
                Some(info) if info.is_array() => {
                    return Err(DomainError::Invalid(format!("{} cannot derive from an array", ty.name)).into());
                }
                Some(_) => {}
                None => return Err(DomainError::UnknownType(base.clone()).into()),
            }
        }

        // Depth-first over local bases; `visiting` catches cycles
        let mut order = Vec::with_capacity(image.types.len());
        let mut done = vec![false; image.types.len()];
        let mut visiting = vec![false; image.types.len()];
        for start in 0..image.types.len() {
            let mut chain = Vec::new();
            let mut cursor = Some(start);
            while let Some(i) = cursor {
                if done[i] {
                    break;
                }
                if visiting[i] {
                    return Err(ImageError::Invalid(format!(
                        "{} is its own base",
                        image.types[i].name
                    )));
                }
                visiting[i] = true;
                chain.push(i);
                cursor = image.types[i].base.as_deref().and_then(|b| local.get(b).copied());
            }
            for &i in chain.iter().rev() {
                done[i] = true;
                order.push(i);
            }
        }
        Ok(order)
    }
}

fn type_builder(
    ty: &TypeDef,
    image: &Image,
    remap: &FxHashMap<MethodToken, MethodToken>,
) -> Result<TypeBuilder, ImageError> {
    let mut builder = match ty.kind {
        TypeKind::Struct => TypeBuilder::value_type(&ty.name),
        _ => TypeBuilder::class(&ty.name),
    };
    if let Some(base) = &ty.base {
        builder = builder.base(base);
    }
    for field in &ty.fields {
        builder = if field.is_static {
            builder.static_field(&field.name, field.ty.clone())
        } else {
            builder.field(&field.name, field.ty.clone())
        };
    }
    for m in image.methods.iter().filter(|m| m.declaring == ty.name) {
        if m.name.is_empty() {
            return Err(ImageError::Invalid(format!("unnamed method on {}", ty.name)));
        }
        let token = remap
            .get(&m.token)
            .copied()
            .ok_or_else(|| ImageError::Invalid(format!("unmapped token {}", m.token)))?;
        let mut mb = MethodBuilder::method(&m.name)
            .kind(m.kind)
            .returns(m.ret.clone())
            .with_token(token);
        for param in &m.params {
            mb = mb.param_info(param.clone());
        }
        if m.attrs.patch_hub {
            mb = mb.patch_hub();
        } else if let Some(body) = &m.body {
            mb = mb.il(remap_body(body, remap)?);
        }
        builder = builder.method(mb);
    }
    Ok(builder)
}

fn remap_body(body: &IlBody, remap: &FxHashMap<MethodToken, MethodToken>) -> Result<IlBody, ImageError> {
    let mut body = body.clone();
    for instr in &mut body.code {
        if let Some(token) = instr.token_mut() {
            *token = remap
                .get(token)
                .copied()
                .ok_or_else(|| ImageError::Invalid(format!("unresolved token {}", token)))?;
        }
    }
    Ok(body)
}
