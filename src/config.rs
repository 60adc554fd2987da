use crate::core::generator::DEFAULT_FWMARK;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Overrides `iptables_command`; the test suite points it at a mock script
pub const IPTABLES_COMMAND_ENV: &str = "FWEXPECT_IPTABLES_COMMAND";

const CONFIG_FILE: &str = "config.json";

/// Host-specific settings for the harness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Packet mark the VPN daemon puts on its own traffic
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    #[serde(default = "default_iptables")]
    pub iptables_command: String,
    #[serde(default = "default_ip")]
    pub ip_command: String,
    /// The VPN client CLI queried for status and settings
    #[serde(default = "default_vpn")]
    pub vpn_command: String,
    /// Assume LAN discovery when building a context from flags
    #[serde(default)]
    pub lan_discovery: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fwmark: default_fwmark(),
            iptables_command: default_iptables(),
            ip_command: default_ip(),
            vpn_command: default_vpn(),
            lan_discovery: false,
        }
    }
}

fn default_fwmark() -> u32 {
    DEFAULT_FWMARK
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_ip() -> String {
    "ip".to_string()
}

fn default_vpn() -> String {
    "nordvpn".to_string()
}

impl HarnessConfig {
    /// Applies environment overrides on top of the stored values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(command) = std::env::var(IPTABLES_COMMAND_ENV)
            && !command.is_empty()
        {
            debug!("iptables command overridden by {IPTABLES_COMMAND_ENV}: {command}");
            self.iptables_command = command;
        }
        self
    }
}

fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Atomically renames it to the target path.
pub async fn save_config(config: &HarnessConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(config, &path).await,
        None => Ok(()),
    }
}

pub async fn save_config_to(config: &HarnessConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        crate::utils::create_private_dir(parent)?;
    }
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

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
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

/// Loads the config, or the defaults if there is none, then applies
/// environment overrides.
pub async fn load_config() -> HarnessConfig {
    let config = match config_path() {
        Some(path) => load_config_from(&path).await,
        None => HarnessConfig::default(),
    };
    config.with_env_overrides()
}

/// Loads `path` without environment overrides. Missing or invalid files
/// yield the defaults.
pub async fn load_config_from(path: &Path) -> HarnessConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Ignoring invalid config {}: {e}", path.display());
            HarnessConfig::default()
        }),
        Err(_) => HarnessConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join(CONFIG_FILE);
        let config = HarnessConfig {
            fwmark: 0x1234,
            iptables_command: "iptables-legacy".into(),
            lan_discovery: true,
            ..HarnessConfig::default()
        };

        save_config_to(&config, &path).await.unwrap();
        assert_eq!(load_config_from(&path).await, config);
        assert!(!path.with_extension("json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_missing_and_invalid_files_give_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        assert_eq!(load_config_from(&path).await, HarnessConfig::default());

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(load_config_from(&path).await, HarnessConfig::default());
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(&path, r#"{"vpn_command": "/opt/vpn/bin/nordvpn"}"#)
            .await
            .unwrap();

        let config = load_config_from(&path).await;
        assert_eq!(config.vpn_command, "/opt/vpn/bin/nordvpn");
        assert_eq!(config.fwmark, DEFAULT_FWMARK);
        assert_eq!(config.iptables_command, "iptables");
    }

    #[test]
    fn test_env_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        let saved = std::env::var(IPTABLES_COMMAND_ENV).ok();

        unsafe {
            std::env::set_var(IPTABLES_COMMAND_ENV, "/tmp/fake-iptables");
        }
        let config = HarnessConfig::default().with_env_overrides();

        unsafe {
            match saved {
                Some(v) => std::env::set_var(IPTABLES_COMMAND_ENV, v),
                None => std::env::remove_var(IPTABLES_COMMAND_ENV),
            }
        }

        assert_eq!(config.iptables_command, "/tmp/fake-iptables");
    }
}
