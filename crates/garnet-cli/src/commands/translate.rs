//! Translate command - print the register bytecode of a routine

use super::load_iseq;
use anyhow::{Context, Result};
use garnet_config::Settings;
use garnet_runtime::{disassemble, translate, validate, RunError, TranslateOptions};
use std::path::Path;
use tracing::debug;

pub fn run(path: &Path, settings: &Settings, json: bool) -> Result<()> {
    let iseq = load_iseq(path)?;
    validate(&iseq).map_err(RunError::Invalid)?;
    debug!(routine = %iseq.name, "Validated routine");
    let routine = translate(&iseq, &TranslateOptions::from(&settings.translator))
        .with_context(|| format!("Failed to translate {}", path.display()))?;
    debug!(routine = %routine.name, insns = routine.code.len(), "Translated routine");

    if json {
        println!("{}", serde_json::to_string_pretty(&*routine)?);
    } else {
        print!("{}", disassemble(&routine));
    }
    Ok(())
}
