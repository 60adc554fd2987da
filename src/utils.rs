//! Utility functions for directory management
//!
//! Follows the XDG Base Directory specification.
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/fwexpect/` - `config.json` and saved scenarios
//! - State: `~/.local/state/fwexpect/` - rule snapshots and the log file
//!
//! # Example
//!
//! ```
//! use fwexpect::utils::{get_data_dir, ensure_dirs};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Load configuration from data_path
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "fwexpect", "fwexpect")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` and its parents with mode 0o700
pub fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

pub fn ensure_dirs() -> std::io::Result<()> {
    if let Some(dir) = get_data_dir() {
        create_private_dir(&dir)?;
    }
    if let Some(dir) = get_state_dir() {
        create_private_dir(&dir)?;
    }
    Ok(())
}
