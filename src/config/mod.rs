//! Configuration management for byoe

pub mod schema;

pub use schema::{
    AppSpec, AppTool, Channel, EnvironmentSpec, LayerKind, LayerOptions, LayerSpec, PhaseConfig,
    SiteConfig,
};

use crate::error::{ByoeError, ByoeResult};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Site configuration file name
pub const CONFIG_FILE: &str = "byoe.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// `./byoe.toml` when present, otherwise the user config directory
    pub fn default_config_path() -> PathBuf {
        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return local;
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("byoe")
            .join(CONFIG_FILE)
    }

    fn conf_d(&self) -> PathBuf {
        self.config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("conf.d")
    }

    /// Directory holding one environment file per environment
    pub fn envs_dir(&self) -> PathBuf {
        self.conf_d().join("envs")
    }

    /// Directory holding one app file per app
    pub fn apps_dir(&self) -> PathBuf {
        self.conf_d().join("apps")
    }

    /// Load and validate the configuration
    pub async fn load(&self) -> ByoeResult<SiteConfig> {
        if !self.config_path.exists() {
            return Err(ByoeError::ConfigNotFound(self.config_path.clone()));
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file, merging `conf.d/envs`
    pub async fn load_from_file(&self, path: &Path) -> ByoeResult<SiteConfig> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ByoeError::io(format!("reading config from {}", path.display()), e))?;

        let mut config: SiteConfig =
            toml::from_str(&content).map_err(|e| ByoeError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        merge_dir(&self.envs_dir(), "environment", &mut config.envs).await?;
        merge_dir(&self.apps_dir(), "app", &mut config.apps).await?;

        config.validate().map_err(|reason| ByoeError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })?;

        debug!(
            "Loaded {} environment(s) from {}",
            config.envs.len(),
            path.display()
        );
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &SiteConfig) -> ByoeResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ByoeError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> ByoeResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ByoeError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the storage tree exists
    pub async fn ensure_storage_dirs(config: &SiteConfig) -> ByoeResult<()> {
        let storage = &config.storage;
        let dirs = [
            storage.base_dir.clone(),
            storage.snapshots_dir(),
            storage.logs_dir(),
            storage.licenses_dir(),
            storage.channels_dir(),
            storage.work_dir(),
            config.cache_root(),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| ByoeError::io(format!("creating directory {}", dir.display()), e))?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Each `<dir>/<name>.toml` defines the entry `<name>`
async fn merge_dir<T: DeserializeOwned>(
    dir: &Path,
    what: &str,
    into: &mut BTreeMap<String, T>,
) -> ByoeResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| ByoeError::io(format!("reading {}", dir.display()), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ByoeError::io(format!("reading {what} entry"), e))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if into.contains_key(&name) {
            return Err(ByoeError::ConfigInvalid {
                path,
                reason: format!("{what} '{name}' is already defined"),
            });
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ByoeError::io(format!("reading {}", path.display()), e))?;
        let value = toml::from_str(&content).map_err(|e| ByoeError::ConfigInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!("Loaded {} {} from {}", what, name, path.display());
        into.insert(name, value);
    }
    Ok(())
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("nonexistent.toml"));

        let err = manager.load().await.unwrap_err();
        assert!(matches!(err, ByoeError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join(CONFIG_FILE));

        let mut config = SiteConfig::default();
        config.storage.base_dir = temp.path().join("stack");
        config.retention.keep = 5;

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.storage.base_dir, temp.path().join("stack"));
        assert_eq!(loaded.retention.keep, 5);
    }

    #[tokio::test]
    async fn merges_env_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[retention]\nkeep = 2\n").unwrap();

        let envs = temp.path().join("conf.d").join("envs");
        std::fs::create_dir_all(&envs).unwrap();
        std::fs::write(
            envs.join("genomics.toml"),
            "[[layers]]\nkind = \"app\"\npackages = [\"samtools\"]\n",
        )
        .unwrap();

        let config = ConfigManager::with_path(path).load().await.unwrap();
        assert_eq!(config.envs.len(), 1);
        assert_eq!(config.envs["genomics"].layers[0].kind, LayerKind::App);
    }

    #[tokio::test]
    async fn merges_app_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[[envs.main.layers]]\nkind = \"base\"\npackages = [\"zlib\"]\n",
        )
        .unwrap();

        let apps = temp.path().join("conf.d").join("apps");
        std::fs::create_dir_all(&apps).unwrap();
        std::fs::write(
            apps.join("jupyter.toml"),
            "tool = \"venv\"\npackages = [\"jupyterlab\"]\ndefault = false\n",
        )
        .unwrap();

        let config = ConfigManager::with_path(path).load().await.unwrap();
        let app = &config.apps["jupyter"];
        assert_eq!(app.tool, AppTool::Venv);
        assert!(!app.default);
        assert_eq!(config.env_layers(&config.envs["main"]).len(), 1);
    }

    #[tokio::test]
    async fn env_file_collision_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[[envs.genomics.layers]]\nkind = \"app\"\npackages = [\"bwa\"]\n",
        )
        .unwrap();

        let envs = temp.path().join("conf.d").join("envs");
        std::fs::create_dir_all(&envs).unwrap();
        std::fs::write(
            envs.join("genomics.toml"),
            "[[layers]]\nkind = \"app\"\npackages = [\"samtools\"]\n",
        )
        .unwrap();

        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[tokio::test]
    async fn invalid_env_reported_with_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[envs.empty]\nlayers = []\n").unwrap();

        let err = ConfigManager::with_path(path.clone()).load().await.unwrap_err();
        match err {
            ByoeError::ConfigInvalid { path: p, reason } => {
                assert_eq!(p, path);
                assert!(reason.contains("no layers"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn creates_storage_tree() {
        let temp = TempDir::new().unwrap();
        let mut config = SiteConfig::default();
        config.storage.base_dir = temp.path().join("stack");

        ConfigManager::ensure_storage_dirs(&config).await.unwrap();

        for sub in ["snapshots", "logs", "licenses", "channels", "work", "cache"] {
            assert!(temp.path().join("stack").join(sub).is_dir(), "{sub}");
        }
    }
}
