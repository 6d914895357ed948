//! `tether verify`: Check an image and load it into a scratch runtime.

use anyhow::Context;
use std::path::Path;
use std::rc::Rc;
use tether_engine::{BridgeOptions, Image, ScriptRuntime, TypeDomain};

pub fn execute(input: &Path, options: &BridgeOptions) -> anyhow::Result<()> {
    let image = Image::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    image
        .verify()
        .with_context(|| format!("{} failed verification", input.display()))?;

    let mut runtime = ScriptRuntime::with_options(Rc::new(TypeDomain::new()), options.clone());
    let types = runtime
        .load_image(&image)
        .with_context(|| format!("{} failed to load", input.display()))?;

    let patchable = image.methods.iter().filter(|m| m.attrs.patchable).count();
    let injected = image.methods.iter().filter(|m| m.attrs.injected).count();
    println!(
        "{}: ok ({} types, {} methods, {} patchable, {} injected)",
        image.name,
        types.len(),
        image.methods.len(),
        patchable,
        injected
    );
    Ok(())
}
