//! Platform-specific state directory management

use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::warn;

const CONFIG_FILE: &str = "anagrafe.toml";
const SESSION_FILE: &str = "session.json";
const LOG_FILE: &str = "cli.log";

/// Resolves where settings, tokens and logs live
pub struct StateDir {
    project_dirs: Option<ProjectDirs>,
    /// Override directory for tests or custom installations
    override_dir: Option<PathBuf>,
    /// Data directory taken from settings
    data_override: Option<PathBuf>,
}

impl StateDir {
    pub fn new() -> Self {
        let project_dirs = ProjectDirs::from("it", "Anagrafe", "anagrafe");
        if project_dirs.is_none() {
            warn!("Failed to determine platform-specific directories, will use fallback");
        }
        Self {
            project_dirs,
            override_dir: None,
            data_override: None,
        }
    }

    /// Keep everything under `path`
    pub fn with_override(path: impl Into<PathBuf>) -> Self {
        Self {
            project_dirs: None,
            override_dir: Some(path.into()),
            data_override: None,
        }
    }

    /// Store tokens and logs in `path`, leaving the config location alone
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_override = Some(path.into());
        self
    }

    pub fn config_dir(&self) -> PathBuf {
        if let Some(override_dir) = &self.override_dir {
            return override_dir.join("config");
        }

        self.project_dirs.as_ref().map_or_else(
            || PathBuf::from("./config"),
            |dirs| dirs.config_dir().to_path_buf(),
        )
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(data_dir) = &self.data_override {
            return data_dir.clone();
        }
        if let Some(override_dir) = &self.override_dir {
            return override_dir.join("data");
        }

        self.project_dirs.as_ref().map_or_else(
            || PathBuf::from("./data"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }

    /// Default settings file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILE)
    }

    /// Persisted token pair
    pub fn session_path(&self) -> PathBuf {
        self.data_dir().join(SESSION_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join(LOG_FILE)
    }
}

impl Default for StateDir {
    fn default() -> Self {
        Self::new()
    }
}
