//! Hot-patch injector
//!
//! Rewrites every patchable method of an image so that it consults the patch
//! hub before running its own body. The prologue is laid out as a fixed
//! sequence of anchored blocks:
//!
//! ```text
//! ArgMarshal       carrier = new object[n + 1]; carrier[i] = arg i
//! HubCall          hub(signature, token, this | null, carrier)
//! VetoBranch       brfalse Original
//! RefOutWriteback  arg i = carrier[i]   (ref/out parameters only)
//! Return           ret carrier[n]       (plain ret for void and .ctor)
//! Original         the untouched original body
//! ```
//!
//! The original body keeps its locals and control flow; it is only shifted
//! down by the length of the prologue. Two locals are appended for the
//! carrier and the return value holder.

use rustc_hash::FxHashMap;

use crate::host::il::{self, CallEffect};
use crate::host::{Anchor, HostType, IlBody, Image, ImageError, Instr, MethodDef, MethodKind, MethodToken, VerifyError};

/// Injector failures. Any of them aborts the whole image.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    /// The image does not have exactly one patch hub
    #[error("Patch hub not found in image `{image}` (expected exactly one, found {found})")]
    HubNotFound {
        /// Image name
        image: String,
        /// Number of hub methods present
        found: usize,
    },

    /// A patchable method already carries an injected prologue
    #[error("Method `{0}` was already injected")]
    DoublePatchDetected(String),

    /// A patchable method cannot take a prologue
    #[error("Method `{signature}` cannot be patched: {reason}")]
    Unpatchable {
        /// Method signature
        signature: String,
        /// Why
        reason: String,
    },

    /// The rewritten body does not verify
    #[error("Injected body of `{signature}` failed verification: {source}")]
    Verify {
        /// Method signature
        signature: String,
        /// Verifier error
        #[source]
        source: VerifyError,
    },

    /// The input image is invalid
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// What an injection run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectReport {
    /// Signature of the patch hub
    pub hub: String,
    /// Signatures of the rewritten methods, image order
    pub injected: Vec<String>,
}

/// Inject patch prologues into every patchable method of `image`.
///
/// The input is left untouched. Running the injector on its own output fails
/// with [`InjectError::DoublePatchDetected`].
pub fn inject(image: &Image) -> Result<(Image, InjectReport), InjectError> {
    image.verify()?;

    let hubs = image.hubs();
    if hubs.len() != 1 {
        return Err(InjectError::HubNotFound {
            image: image.name.clone(),
            found: hubs.len(),
        });
    }
    let hub = hubs[0];
    let hub_token = hub.token;
    let mut report = InjectReport {
        hub: hub.signature(),
        injected: Vec::new(),
    };

    let effects: FxHashMap<MethodToken, CallEffect> =
        image.methods.iter().map(|m| (m.token, m.call_effect())).collect();
    let resolve = |token: MethodToken| effects.get(&token).copied();

    let mut out = image.clone();
    for method in out.methods.iter_mut().filter(|m| m.attrs.patchable) {
        let signature = method.signature();
        if method.attrs.injected || carries_prologue(method) {
            return Err(InjectError::DoublePatchDetected(signature));
        }
        if method.attrs.patch_hub {
            return Err(InjectError::Unpatchable {
                signature,
                reason: "the patch hub cannot patch itself".to_string(),
            });
        }
        let body = inject_body(method, hub_token)?;
        il::verify(&body, method.shape(), &resolve).map_err(|source| InjectError::Verify {
            signature: signature.clone(),
            source,
        })?;
        method.body = Some(body);
        method.attrs.injected = true;
        log::info!("injected {}", signature);
        report.injected.push(signature);
    }
    Ok((out, report))
}

/// Whether the body already holds an injected prologue, flag or not
fn carries_prologue(method: &MethodDef) -> bool {
    method
        .body
        .as_ref()
        .is_some_and(|body| body.anchor(Anchor::HubCall).is_some() || body.anchor(Anchor::Original).is_some())
}

/// Rewritten body of one method
pub fn inject_body(method: &MethodDef, hub: MethodToken) -> Result<IlBody, InjectError> {
    let original = method.body.as_ref().ok_or_else(|| InjectError::Unpatchable {
        signature: method.signature(),
        reason: "no IL body".to_string(),
    })?;
    let n = method.params.len();
    let index = |i: usize| {
        u16::try_from(i).map_err(|_| InjectError::Unpatchable {
            signature: method.signature(),
            reason: "too many parameters or locals".to_string(),
        })
    };

    let mut locals = original.locals.clone();
    let carrier = index(locals.len())?;
    locals.push(HostType::array(HostType::Object));
    let ret_local = if method.returns_value() {
        let slot = index(locals.len())?;
        locals.push(method.ret.clone());
        Some(slot)
    } else {
        None
    };

    let mut code = vec![
        Instr::Anchor(Anchor::ArgMarshal),
        Instr::LdInt(n as i64 + 1),
        Instr::NewArr(HostType::Object),
        Instr::StLoc(carrier),
    ];
    for i in 0..n {
        code.extend([
            Instr::LdLoc(carrier),
            Instr::LdInt(i as i64),
            Instr::LdArg(index(i)?),
            Instr::StElem,
        ]);
    }

    code.extend([
        Instr::Anchor(Anchor::HubCall),
        Instr::LdStr(method.signature()),
        Instr::LdToken(method.token),
        if method.kind == MethodKind::Static {
            Instr::LdNull
        } else {
            Instr::LdThis
        },
        Instr::LdLoc(carrier),
        Instr::Call(hub),
        Instr::Anchor(Anchor::VetoBranch),
    ]);
    let veto = code.len();
    // Target patched below, once the prologue length is known
    code.push(Instr::BrFalse(0));

    code.push(Instr::Anchor(Anchor::RefOutWriteback));
    for (i, _) in method.params.iter().enumerate().filter(|(_, p)| p.is_by_ref()) {
        code.extend([
            Instr::LdLoc(carrier),
            Instr::LdInt(i as i64),
            Instr::LdElem,
            Instr::StArg(index(i)?),
        ]);
    }

    code.push(Instr::Anchor(Anchor::Return));
    if let Some(ret) = ret_local {
        code.extend([
            Instr::LdLoc(carrier),
            Instr::LdInt(n as i64),
            Instr::LdElem,
            Instr::StLoc(ret),
            Instr::LdLoc(ret),
        ]);
    }
    code.push(Instr::Ret);

    let start = code.len();
    code[veto] = Instr::BrFalse(start as u32);
    code.push(Instr::Anchor(Anchor::Original));

    let shift = (start + 1) as u32;
    for instr in &original.code {
        let mut moved = instr.clone();
        if let Some(target) = moved.branch_target_mut() {
            *target += shift;
        }
        code.push(moved);
    }
    Ok(IlBody::with_locals(locals, code))
}
