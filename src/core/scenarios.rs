//! Saved scenarios
//!
//! A scenario is a named, reusable [`FirewallContext`] stored as a standalone
//! JSON file under `<data>/scenarios/`. A `.json.sha256` sidecar records the
//! checksum written at save time; a mismatch on load (file edited by hand)
//! is logged, not rejected.

use crate::core::context::FirewallContext;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Error type for scenario operations
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Invalid scenario name: {0}")]
    InvalidName(String),

    #[error("Scenario not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data directory not available")]
    DataDirUnavailable,
}

/// A stored scenario file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub context: FirewallContext,
}

impl Scenario {
    pub fn new(context: FirewallContext) -> Self {
        Self {
            description: String::new(),
            context,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Validates a scenario name for filesystem safety.
///
/// Constraints:
/// - Alphanumeric, underscores, and hyphens only
/// - Max 64 chars
/// - Rejects "." and ".." (path traversal)
pub fn validate_scenario_name(name: &str) -> Result<(), ScenarioError> {
    if name.is_empty() {
        return Err(ScenarioError::InvalidName("Name cannot be empty".into()));
    }

    if name.len() > 64 {
        return Err(ScenarioError::InvalidName("Name too long (max 64 chars)".into()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ScenarioError::InvalidName(
            "Name contains invalid characters (use only a-z, 0-9, _, -)".into(),
        ));
    }

    Ok(())
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Scenario files in one directory
#[derive(Debug, Clone)]
pub struct ScenarioStore {
    dir: PathBuf,
}

impl ScenarioStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data>/scenarios/`
    pub fn default_location() -> Result<Self, ScenarioError> {
        let dir = get_data_dir().ok_or(ScenarioError::DataDirUnavailable)?;
        Ok(Self::new(dir.join("scenarios")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<(), ScenarioError> {
        if !tokio::fs::try_exists(&self.dir).await? {
            crate::utils::create_private_dir(&self.dir)?;
        }
        Ok(())
    }

    /// Path of a scenario file. Validates the name before touching the
    /// filesystem.
    pub fn path(&self, name: &str) -> Result<PathBuf, ScenarioError> {
        validate_scenario_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Sorted names of every `.json` file in the store
    pub async fn list(&self) -> Result<Vec<String>, ScenarioError> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if path.is_file()
                && path.extension().and_then(|s| s.to_str()) == Some("json")
                && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    pub async fn load(&self, name: &str) -> Result<Scenario, ScenarioError> {
        let path = self.path(name)?;

        if !tokio::fs::try_exists(&path).await? {
            return Err(ScenarioError::NotFound(name.to_string()));
        }

        let json = tokio::fs::read_to_string(&path).await?;

        let checksum_path = path.with_extension("json.sha256");
        if let Ok(expected) = tokio::fs::read_to_string(&checksum_path).await {
            let actual = checksum(&json);
            if expected.trim() != actual {
                warn!(
                    "Scenario '{}' checksum mismatch (expected: {}, got: {})",
                    name,
                    expected.trim(),
                    actual
                );
            }
        }

        Ok(serde_json::from_str(&json)?)
    }

    /// Saves atomically (temp file + rename) and writes the checksum sidecar.
    pub async fn save(&self, name: &str, scenario: &Scenario) -> Result<PathBuf, ScenarioError> {
        let path = self.path(name)?;
        self.ensure_dir().await?;
        let json = serde_json::to_string_pretty(scenario)?;

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
            tokio::fs::write(&temp_path, &json).await?;
        }

        tokio::fs::rename(&temp_path, &path).await?;
        tokio::fs::write(path.with_extension("json.sha256"), checksum(&json)).await?;

        info!("Saved scenario '{name}' to {}", path.display());
        Ok(path)
    }

    pub async fn delete(&self, name: &str) -> Result<(), ScenarioError> {
        let path = self.path(name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(ScenarioError::NotFound(name.to_string()));
        }

        tokio::fs::remove_file(&path).await?;

        let checksum_path = path.with_extension("json.sha256");
        if tokio::fs::try_exists(&checksum_path).await? {
            tokio::fs::remove_file(checksum_path).await?;
        }

        info!("Deleted scenario '{name}'");
        Ok(())
    }
}
