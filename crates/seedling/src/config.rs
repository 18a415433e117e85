//! Settings shared by the library and the binary, stored as toml.
use std::path::{Path, PathBuf};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::fs::{create_dir_all, read_to_string, write};
use tracing::warn;

use crate::{connection_manager::DEFAULT_MAX_CONNECTIONS, error::Error};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    /// First port the listener tries, `0` lets the OS pick one.
    pub listen_port_min: u16,
    pub listen_port_max: u16,
    pub max_connections: usize,
    /// Bytes per second, `0` blocks uploads.
    pub upload_limit: u64,
    /// Bytes per second, `0` blocks downloads.
    pub download_limit: u64,
    /// Makes piece and peer selection deterministic.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir,
            listen_port_min: 6881,
            listen_port_max: 6889,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            upload_limit: 1024 * 1024,
            download_limit: 16 * 1024 * 1024,
            rng_seed: None,
        }
    }
}

impl Config {
    /// Directory of the config file and of the resume states.
    ///
    /// # Errors
    ///
    /// Fails if the user has no home folder.
    pub fn config_dir() -> Result<PathBuf, Error> {
        let dirs = ProjectDirs::from("", "", "Seedling").ok_or(Error::NoHomeDir)?;
        Ok(dirs.config_dir().to_path_buf())
    }

    pub fn config_file() -> Result<PathBuf, Error> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the configuration file at the user's config folder.
    ///
    /// A missing or invalid file is replaced with the default configuration.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_file()?;
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self, Error> {
        if let Ok(content) = read_to_string(path).await {
            match toml::from_str::<Config>(&content) {
                Ok(config) => return Ok(config),
                Err(e) => warn!("{} is not valid, writing defaults: {e}", path.display()),
            }
        }

        let config = Config::default();
        config.save_to(path).await?;
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .map_err(|_| Error::FolderCreate(parent.display().to_string()))?;
        }
        write(path, toml::to_string(self)?).await?;
        Ok(())
    }

    /// Ports the listener tries, in order.
    pub fn listen_ports(&self) -> impl Iterator<Item = u16> {
        let max = self.listen_port_max.max(self.listen_port_min);
        self.listen_port_min..=max
    }
}
