//! Daemon configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_err as fs;
use resync_core::Account;
use resync_core::store::PENDING_FILE_NAME;

use crate::filter::FilterSettings;
use crate::DaemonError;

pub const CONFIG_FILE_NAME: &str = "resync.toml";

/// One account whose cache directory is monitored.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AccountConfig {
    /// Server URL.
    pub server: String,
    /// Login of the account on that server.
    pub email: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Local directory holding this account's cached files.
    pub cache_dir: PathBuf,
}

impl AccountConfig {
    pub fn account(&self) -> Account {
        let account = Account::new(&self.server, &self.email);
        match &self.name {
            Some(name) => account.with_name(name),
            None => account,
        }
    }
}

/// Configuration for the resync daemon.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (the pending-task store).
    pub state_dir: PathBuf,
    /// Catalog of cached files.
    pub catalog_path: PathBuf,
    /// Root of the upload destination.
    pub remote_root: PathBuf,
    /// Accounts to monitor.
    pub accounts: Vec<AccountConfig>,
    /// Minimum quiet period after the last write before a file is uploaded.
    pub stability_window_ms: u64,
    /// How long changes to a file are ignored after the client downloaded it.
    /// Must exceed `stability_window_ms`.
    pub grace_window_ms: u64,
    /// Log level.
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".resync"),
            catalog_path: PathBuf::from(".resync/catalog.json"),
            remote_root: PathBuf::new(),
            accounts: vec![],
            stability_window_ms: 5_000,
            grace_window_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let content = fs::read_to_string(path)?;
        let mut config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| DaemonError::ConfigError(format!("{}: {}", path.display(), e)))?;

        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), DaemonError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DaemonError::ConfigError(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        log::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.stability_window_ms == 0 {
            return Err(DaemonError::ConfigError(
                "stability_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.grace_window_ms <= self.stability_window_ms {
            return Err(DaemonError::ConfigError(format!(
                "grace_window_ms ({}) must exceed stability_window_ms ({})",
                self.grace_window_ms, self.stability_window_ms
            )));
        }
        if self.remote_root.as_os_str().is_empty() {
            return Err(DaemonError::ConfigError("remote_root is not set".to_string()));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.account()) {
                return Err(DaemonError::ConfigError(format!(
                    "account {} is listed more than once",
                    account.account()
                )));
            }
        }
        Ok(())
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            stability_window: Duration::from_millis(self.stability_window_ms),
            grace_window: Duration::from_millis(self.grace_window_ms),
        }
    }

    pub fn task_store_path(&self) -> PathBuf {
        self.state_dir.join(PENDING_FILE_NAME)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() && !p.as_os_str().is_empty() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.state_dir);
        resolve(&mut self.catalog_path);
        resolve(&mut self.remote_root);
        for account in &mut self.accounts {
            resolve(&mut account.cache_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> DaemonConfig {
        DaemonConfig {
            remote_root: PathBuf::from("/srv/remote"),
            accounts: vec![AccountConfig {
                server: "https://cloud.example.com".to_string(),
                email: "alice@example.com".to_string(),
                name: None,
                cache_dir: PathBuf::from("/var/cache/resync/alice"),
            }],
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_remote_is_set() {
        let config = valid_config();
        config.validate().unwrap();
        let settings = config.filter_settings();
        assert_eq!(settings.stability_window, Duration::from_secs(5));
        assert_eq!(settings.grace_window, Duration::from_secs(10));
    }

    #[test]
    fn grace_window_must_exceed_stability_window() {
        let mut config = valid_config();
        config.grace_window_ms = config.stability_window_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must exceed"));
    }

    #[test]
    fn zero_stability_window_is_rejected() {
        let mut config = valid_config();
        config.stability_window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_accounts_are_rejected() {
        let mut config = valid_config();
        let mut dup = config.accounts[0].clone();
        dup.cache_dir = PathBuf::from("/elsewhere");
        config.accounts.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn save_and_load_resolves_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);

        let mut config = valid_config();
        config.remote_root = PathBuf::from("remote");
        config.accounts[0].cache_dir = PathBuf::from("cache/alice");
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.remote_root, tmp.path().join("remote"));
        assert_eq!(loaded.accounts[0].cache_dir, tmp.path().join("cache/alice"));
        assert_eq!(loaded.state_dir, tmp.path().join(".resync"));
        assert_eq!(loaded.task_store_path(), tmp.path().join(".resync/pending.json"));
        assert_eq!(loaded.stability_window_ms, 5_000);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "remote_root = \"/srv/remote\"\ngrace_window_ms = 20000\n").unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.grace_window_ms, 20_000);
        assert_eq!(loaded.stability_window_ms, 5_000);
        assert!(loaded.accounts.is_empty());
        loaded.validate().unwrap();
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "stability_window_ms = \"soon\"").unwrap();

        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(matches!(err, DaemonError::ConfigError(_)));
    }
}
