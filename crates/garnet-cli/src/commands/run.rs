//! Run command - translate and execute a routine

use super::load_iseq;
use anyhow::{bail, Result};
use garnet_config::Settings;
use garnet_runtime::{Garnet, ReferenceHost};
use std::path::Path;
use tracing::debug;

pub fn run(path: &Path, settings: &Settings) -> Result<()> {
    let iseq = load_iseq(path)?;
    let mut garnet = Garnet::with_host(ReferenceHost::new(), settings);

    debug!(routine = %iseq.name, specialize = settings.vm.specialize, "Running routine");
    let outcome = garnet.run(&iseq);
    debug!(ok = outcome.is_ok(), "Routine finished");
    match &outcome {
        Ok(value) => println!("{}", garnet.inspect(value)),
        Err(err) => eprintln!("{}: {}", path.display(), garnet.describe(err)),
    }
    if let Some(profiler) = garnet.profiler() {
        println!();
        print!("{}", profiler.report());
    }
    if outcome.is_err() {
        bail!("Failed to execute routine");
    }
    Ok(())
}
