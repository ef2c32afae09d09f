use crate::audit::AuditLog;
use crate::core::error::StoreError;
use crate::core::identity::{Directory, DirectoryError};
use crate::core::manager::DEFAULT_SYNC_TIMEOUT;
use crate::core::store::FileStore;
use crate::core::sync::{Backend, FirewallConfig};
use crate::utils::{create_private_dir, get_config_dir};
use crate::validators::IpPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `sync_timeout_secs`
const MAX_SYNC_TIMEOUT_SECS: u64 = 600;

/// Complete application configuration, resolved once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Handed to the firewall backend as-is
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub policy: IpPolicy,
    /// Bound on a single firewall call (clamped to 1..=600)
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    /// Overrides `<data dir>/allowlists`
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub organizations: Vec<OrganizationConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    /// Hex SHA-256 of the account's API key (`dbgate hash-key`)
    #[serde(default)]
    pub api_key_sha256: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationConfig {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            firewall: FirewallConfig::default(),
            policy: IpPolicy::default(),
            sync_timeout_secs: default_sync_timeout(),
            store_dir: None,
            audit_enabled: true,
            accounts: Vec::new(),
            organizations: Vec::new(),
        }
    }
}

fn default_sync_timeout() -> u64 {
    DEFAULT_SYNC_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config directory not available")]
    ConfigDirUnavailable,

    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid policy in {path}: {reason}")]
    InvalidPolicy { path: PathBuf, reason: String },

    #[error("{0} already exists (use --force to overwrite)")]
    AlreadyExists(PathBuf),

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("The memory firewall backend keeps nothing between runs; configure nftables")]
    EphemeralBackend,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs.clamp(1, MAX_SYNC_TIMEOUT_SECS))
    }

    /// Builds the account/organization registry.
    ///
    /// Accounts are registered before organizations so organizations can only
    /// reference accounts defined in the same file.
    pub fn directory(&self) -> Result<Directory, ConfigError> {
        let mut directory = Directory::new();
        for account in &self.accounts {
            directory.add_account(
                &account.username,
                account.api_key_sha256.clone(),
                account.features.clone(),
            )?;
        }
        for org in &self.organizations {
            directory.add_organization(&org.name, &org.owner, &org.members)?;
        }
        Ok(directory)
    }

    /// Backend for a long-lived deployment.
    ///
    /// The memory backend is refused: its rules vanish with the process while
    /// the file store keeps the list, so nothing would be enforced.
    pub fn firewall_backend(&self) -> Result<Backend, ConfigError> {
        match &self.firewall {
            FirewallConfig::Memory { .. } => Err(ConfigError::EphemeralBackend),
            FirewallConfig::Nftables(_) => Ok(Backend::from_config(&self.firewall)),
        }
    }

    pub fn store(&self) -> Result<FileStore, ConfigError> {
        match &self.store_dir {
            Some(dir) => Ok(FileStore::new(dir)),
            None => Ok(FileStore::in_data_dir()?),
        }
    }

    /// Audit log in the state directory, `None` when disabled or unavailable
    pub fn audit_log(&self) -> Option<AuditLog> {
        if !self.audit_enabled {
            return None;
        }
        match AuditLog::new() {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!("Audit logging disabled: {}", e);
                None
            }
        }
    }
}

/// `<config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads configuration.
///
/// An explicit `path` must exist. Without one, the default location is used
/// and a missing file yields [`AppConfig::default`]. A file that exists but
/// does not parse is always an error; falling back to defaults would silently
/// drop every configured account.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (
            default_config_path().ok_or(ConfigError::ConfigDirUnavailable)?,
            false,
        ),
    };

    let json = match tokio::fs::read_to_string(&path).await {
        Ok(json) => json,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    let config: AppConfig = match serde_json::from_str(&json) {
        Ok(config) => config,
        Err(source) => return Err(ConfigError::Parse { path, source }),
    };
    if let Err(reason) = config.policy.check() {
        return Err(ConfigError::InvalidPolicy { path, reason });
    }
    Ok(config)
}

/// Writes a default configuration to `path` (or the default location).
///
/// An existing file is only replaced when `force` is set.
pub async fn init_config(path: Option<&Path>, force: bool) -> Result<PathBuf, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or(ConfigError::ConfigDirUnavailable)?,
    };

    if !force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ConfigError::AlreadyExists(path));
    }

    let write = async {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)?;
        }
        save_config(&AppConfig::default(), &path).await
    };
    match write.await {
        Ok(()) => Ok(path),
        Err(source) => Err(ConfigError::Write { path, source }),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}
