pub mod deploy;
pub mod init;
pub mod inspect;

use std::path::Path;

use anyhow::Context;
use cutover_core::CutoverConfig;
use cutover_deploy::Orchestrator;

/// Load the configuration and open the selected environment.
fn open(config: &Path, env: Option<&str>) -> anyhow::Result<Orchestrator> {
    let config = CutoverConfig::from_file(config)?;
    let env = config.environment(env)?;
    let name = env.name.clone();
    Orchestrator::open(env).with_context(|| format!("opening environment {name}"))
}
