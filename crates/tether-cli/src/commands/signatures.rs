//! `tether signatures`: List method signatures, the keys `patch` expects.

use anyhow::Context;
use std::path::Path;
use tether_engine::Image;

pub fn execute(input: &Path, patchable_only: bool) -> anyhow::Result<()> {
    let image = Image::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    for method in &image.methods {
        if patchable_only && !method.attrs.patchable {
            continue;
        }
        let marker = match (method.attrs.patch_hub, method.attrs.injected) {
            (true, _) => " [hub]",
            (_, true) => " [injected]",
            _ => "",
        };
        println!("{}{}", method.signature(), marker);
    }
    Ok(())
}
