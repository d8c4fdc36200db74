//! Settings file loading for the mail sync engine
//!
//! Settings are JSON documents kept in one directory, by default
//! `~/.config/mail-sync/`. The directory can be redirected with the
//! `MAIL_SYNC_CONFIG_DIR` environment variable, which is what tests and
//! embedders with their own profile layout use.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable overriding the settings directory
pub const CONFIG_DIR_ENV: &str = "MAIL_SYNC_CONFIG_DIR";

const APP_DIR_NAME: &str = "mail-sync";

/// A directory holding JSON settings files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    /// Use an explicit directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Find the settings directory: `MAIL_SYNC_CONFIG_DIR` if set, otherwise
    /// the platform config directory. Returns None when neither is available.
    pub fn locate() -> Option<Self> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            return Some(Self::new(dir));
        }
        dirs::config_dir().map(|p| Self::new(p.join(APP_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a settings file within this directory
    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path(filename).exists()
    }

    /// Create the directory if it doesn't exist yet
    pub fn ensure(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create config directory: {}", self.root.display())
        })?;
        Ok(&self.root)
    }

    /// Load and parse a settings file. A missing file is an error.
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        load_json_file(&self.path(filename))
    }

    /// Load a settings file, or the type's default when the file is absent.
    ///
    /// A file that exists but fails to parse is still reported as an error so
    /// a typo does not silently reset every setting.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, filename: &str) -> Result<T> {
        if !self.exists(filename) {
            return Ok(T::default());
        }
        self.load(filename)
    }

    /// Write a value as pretty JSON, replacing the file atomically
    pub fn save<T: Serialize>(&self, filename: &str, value: &T) -> Result<()> {
        self.ensure()?;
        let path = self.path(filename);
        let tmp = self.path(&format!(".{filename}.tmp"));
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write config file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace config file: {}", path.display()))?;
        Ok(())
    }
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
