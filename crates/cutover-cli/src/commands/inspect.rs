use std::path::Path;

use cutover_deploy::{PruneSummary, to_json};

/// Print the environment snapshot. While another process is deploying the
/// store is held open, and this fails with `DeploymentInProgress`.
pub fn status(config: &Path, env: Option<&str>, json: bool) -> anyhow::Result<()> {
    let orchestrator = super::open(config, env)?;
    let report = orchestrator.status()?;
    if json {
        println!("{}", to_json(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

pub fn prune(config: &Path, env: Option<&str>) -> anyhow::Result<()> {
    let report = super::open(config, env)?.prune()?;
    print!("{}", PruneSummary(&report));
    Ok(())
}
