use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = ".gatorconfig.json";

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "GATOR_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Database connection string
    pub db_url: String,
    /// Empty when nobody is logged in
    #[serde(default)]
    pub current_user_name: String,
    #[serde(skip)]
    path: PathBuf,
}

impl Config {
    /// Reads the config from `$GATOR_CONFIG`, falling back to `~/.gatorconfig.json`.
    pub fn read() -> Result<Self> {
        Self::load(default_path()?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_str(&content)?;
        config.path = path.as_ref().to_path_buf();
        Ok(config)
    }

    /// Parse config from a JSON string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_logged_in(&self) -> bool {
        !self.current_user_name.is_empty()
    }

    /// Sets the current user and rewrites the whole file.
    pub fn set_user(&mut self, name: &str) -> Result<()> {
        self.current_user_name = name.to_string();
        self.write()
    }

    fn write(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

fn default_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(Error::NoHomeDir)?;
    Ok(home.join(CONFIG_FILE_NAME))
}
