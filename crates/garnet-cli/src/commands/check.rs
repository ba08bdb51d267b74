//! Check command - validate stack bytecode without translating it

use super::load_iseq;
use anyhow::{bail, Result};
use garnet_runtime::validate;
use std::path::Path;
use tracing::debug;

pub fn run(path: &Path) -> Result<()> {
    let iseq = load_iseq(path)?;
    debug!(routine = %iseq.name, "Validating routine");
    match validate(&iseq) {
        Ok(()) => {
            println!("{}: No errors found", path.display());
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("{}: {}", path.display(), error);
            }
            bail!("{} validation error(s)", errors.len())
        }
    }
}
