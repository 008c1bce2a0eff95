//! Initialize the hub home: config file, data directory and the authorization store with its
//! `all` group.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::authz::AuthzService;
use crate::config::{self, HubConfig};

/// Paths created or found by [`init_hub`].
#[derive(Debug, Clone)]
pub struct InitResult {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub acl_file: PathBuf,
}

/// Ensure the hub has been initialized (config file and data directory exist).
pub fn require_initialized(config_path: &Path, config: &HubConfig) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "hub not initialized; run `hubd init` first (config file not found: {})",
            config_path.display()
        );
    }
    let data_dir = config::resolve_data_dir(config);
    if !data_dir.exists() {
        anyhow::bail!(
            "hub not initialized; run `hubd init` first (data directory not found: {})",
            data_dir.display()
        );
    }
    Ok(())
}

/// Create whatever is missing. Existing files are left as they are.
/// - Writes the config file with `{}` if missing.
/// - Creates the data directory.
/// - Opens the ACL file, which creates it with the `all` group.
pub fn init_hub(config_path: &Path) -> Result<InitResult> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }
    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;

    let data_dir = config::resolve_data_dir(&config);
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        log::info!("created data directory at {}", data_dir.display());
    }

    let acl_file = config::resolve_acl_file(&config, &data_dir);
    AuthzService::start(&acl_file)
        .with_context(|| format!("initializing authorization store {}", acl_file.display()))?;

    Ok(InitResult {
        config_path: config_path.to_path_buf(),
        data_dir,
        acl_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::ALL_GROUP_ID;

    #[test]
    fn init_creates_config_data_dir_and_all_group() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("hub.json");
        let data_dir = dir.path().join("stores");
        std::fs::write(
            &config_path,
            serde_json::json!({"dataDir": data_dir}).to_string(),
        )
        .unwrap();

        let res = init_hub(&config_path).unwrap();
        assert_eq!(res.data_dir, data_dir);
        assert!(res.acl_file.exists());
        let (config, _) = config::load_config(Some(config_path.clone())).unwrap();
        require_initialized(&config_path, &config).unwrap();

        let authz = AuthzService::start(&res.acl_file).unwrap();
        assert!(authz.get_group(ALL_GROUP_ID).is_ok());

        // a second run keeps what is there
        init_hub(&config_path).unwrap();
        assert!(std::fs::read_to_string(&config_path).unwrap().contains("dataDir"));
    }

    #[test]
    fn missing_config_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.json");
        assert!(require_initialized(&path, &HubConfig::default()).is_err());
    }
}
