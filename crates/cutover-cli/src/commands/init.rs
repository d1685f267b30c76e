//! `cutover init`: write a configuration scaffold for one environment.

use std::path::Path;

use anyhow::{Context, bail};
use cutover_core::CutoverConfig;

pub fn init(path: &Path, env: Option<&str>, root: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let name = env.unwrap_or("production");
    let config = CutoverConfig::scaffold(name, root);
    // Reject a scaffold that would not load back, e.g. a relative root.
    config.environment(Some(name))?;

    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("✓ Generated {} for environment {name}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.toml");

        init(&path, Some("staging"), "/srv/shop", false).unwrap();
        let config = CutoverConfig::from_file(&path).unwrap();
        let env = config.environment(None).unwrap();
        assert_eq!(env.name, "staging");
        assert_eq!(env.root, Path::new("/srv/shop"));
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.toml");
        std::fs::write(&path, "# hand written\n").unwrap();

        assert!(init(&path, None, "/srv/shop", false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# hand written\n");

        init(&path, None, "/srv/shop", true).unwrap();
        assert!(CutoverConfig::from_file(&path).is_ok());
    }

    #[test]
    fn rejects_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.toml");
        assert!(init(&path, None, "srv/shop", false).is_err());
        assert!(!path.exists());
    }
}
