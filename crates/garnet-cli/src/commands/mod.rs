pub mod check;
pub mod run;
pub mod translate;

use anyhow::{Context, Result};
use garnet_runtime::Iseq;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Read and decode a JSON stack routine.
pub fn load_iseq(path: &Path) -> Result<Iseq> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read routine file: {}", path.display()))?;
    let iseq = Iseq::from_json(&text)
        .with_context(|| format!("Failed to decode routine: {}", path.display()))?;
    debug!(path = %path.display(), routine = %iseq.name, insns = iseq.insns.len(), "Loaded routine");
    Ok(iseq)
}
