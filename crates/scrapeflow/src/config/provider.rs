//! Sources of configuration for long-running components.
//!
//! The orchestrator calls [`ConfigProvider::reload`] at the start of every
//! invocation, so switch and job edits take effect without a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::loader::load_config;
use crate::config::schema::Config;
use crate::error::ConfigError;

pub trait ConfigProvider: Send + Sync {
    /// Last successfully loaded configuration.
    fn current(&self) -> Arc<Config>;

    /// Re-reads the backing store. On failure the previous configuration
    /// stays in place and the error is returned.
    fn reload(&self) -> Result<Arc<Config>, ConfigError>;
}

/// Reads a YAML/JSON file from disk.
pub struct FileConfigProvider {
    path: PathBuf,
    config: RwLock<Arc<Config>>,
}

impl FileConfigProvider {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = load_config(&path)?;
        Ok(Self {
            path,
            config: RwLock::new(Arc::new(config)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn current(&self) -> Arc<Config> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let config = Arc::new(load_config(&self.path)?);
        match self.config.write() {
            Ok(mut guard) => *guard = Arc::clone(&config),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&config),
        }
        log::debug!("Reloaded configuration from {}", self.path.display());
        Ok(config)
    }
}

/// Holds a configuration in memory. `reload` returns whatever was last
/// stored with [`StaticConfigProvider::replace`].
pub struct StaticConfigProvider {
    config: RwLock<Arc<Config>>,
}

impl StaticConfigProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn replace(&self, config: Config) {
        match self.config.write() {
            Ok(mut guard) => *guard = Arc::new(config),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
        }
    }

    /// Applies `f` to a copy of the current configuration and stores it.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut config = (*self.current()).clone();
        f(&mut config);
        self.replace(config);
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn current(&self) -> Arc<Config> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config_from_str;

    const CONFIG: &str = r#"
version: "1.0"
scraper:
  program: urs
  working_directory: /opt/urs
  scrapes_directory: /opt/urs/scrapes
switches:
  archive_enabled: false
"#;

    #[test]
    fn test_file_provider_reload_picks_up_edits() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, CONFIG).unwrap();

        let provider = FileConfigProvider::open(&path).unwrap();
        assert!(provider.current().switches.master_enabled);

        let edited = format!("{}  master_enabled: false\n", CONFIG);
        std::fs::write(&path, edited).unwrap();

        let reloaded = provider.reload().unwrap();
        assert!(!reloaded.switches.master_enabled);
        assert!(!provider.current().switches.master_enabled);
    }

    #[test]
    fn test_file_provider_keeps_last_good_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, CONFIG).unwrap();

        let provider = FileConfigProvider::open(&path).unwrap();
        std::fs::write(&path, "version: [broken").unwrap();

        assert!(provider.reload().is_err());
        assert_eq!(provider.current().scraper.program, "urs");
    }

    #[test]
    fn test_static_provider_update() {
        let provider = StaticConfigProvider::new(load_config_from_str(CONFIG).unwrap());
        provider.update(|config| config.switches.manual_enabled = false);
        assert!(!provider.reload().unwrap().switches.manual_enabled);
    }
}
