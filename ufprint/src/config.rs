use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::info;
use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ufprint/ufprint.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub socket_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/ufprint/helper.sock"),
            timeout_secs: 120,
        }
    }
}

impl HelperConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub pam_dir: PathBuf,
    pub vendor_dir: PathBuf,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            pam_dir: PathBuf::from("/etc/pam.d"),
            vendor_dir: PathBuf::from("/usr/lib/pam.d"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrollConfig {
    pub default_stages: u32,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self { default_stages: 5 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub helper: HelperConfig,
    pub policy: PolicyConfig,
    pub enroll: EnrollConfig,
}

impl Config {
    pub fn from_file<P>(file_path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file_data = fs::read_to_string(file_path)?;

        let config = toml::from_str(&file_data)?;

        Ok(config)
    }

    /// Like [`Config::from_file`] but a missing file yields the defaults.
    pub fn load<P>(file_path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file_path = file_path.as_ref();

        if file_path.exists() {
            Self::from_file(file_path)
        } else {
            info!("{} not found, using defaults", file_path.display());
            Ok(Self::default())
        }
    }
}
