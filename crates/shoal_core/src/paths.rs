use anyhow::{Context, Result};
use std::path::PathBuf;

/// Well-known locations under the shoal data directory.
pub struct ShoalPaths;

impl ShoalPaths {
    /// Returns the base data directory: `~/.shoal/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".shoal"))
    }

    /// Returns the logs directory: `~/.shoal/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the coordinator config path: `~/.shoal/coordinator.json`
    pub fn coordinator_config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("coordinator.json"))
    }

    /// Returns the peer config path: `~/.shoal/peer.json`
    pub fn peer_config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("peer.json"))
    }

    /// Ensures the base and logs directories exist.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_base_dir() {
        let base = ShoalPaths::base_dir().unwrap();
        assert!(base.ends_with(".shoal"));
        assert_eq!(ShoalPaths::logs_dir().unwrap(), base.join("logs"));
        assert_eq!(
            ShoalPaths::coordinator_config_path().unwrap(),
            base.join("coordinator.json")
        );
        assert_eq!(ShoalPaths::peer_config_path().unwrap(), base.join("peer.json"));
    }
}
