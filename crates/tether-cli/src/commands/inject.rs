//! `tether inject`: Rewrite patchable methods to consult the patch hub.

use anyhow::Context;
use std::path::Path;
use tether_engine::{inject, Image};

pub fn execute(input: &Path, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let image = Image::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let (injected, report) = inject(&image).with_context(|| format!("failed to inject {}", input.display()))?;

    let output = output.unwrap_or(input);
    injected
        .write(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    let digest = injected.digest()?;

    if json {
        let out = serde_json::json!({
            "image": injected.name,
            "hub": report.hub,
            "injected": report.injected,
            "output": output.display().to_string(),
            "digest": digest,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Hub: {}", report.hub);
    for signature in &report.injected {
        println!("  injected {}", signature);
    }
    println!(
        "Wrote {} ({} methods injected)",
        output.display(),
        report.injected.len()
    );
    println!("sha256 {}", digest);
    Ok(())
}
