use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::drive::{DEFAULT_API_URL, DEFAULT_UPLOAD_URL};
use crate::rotation::BackupPlan;

pub const TOKEN_ENV: &str = "DRIVEBACK_ACCESS_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_keepfiles")]
    pub keepfiles: usize,
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_retry_delay")]
    pub archive_retry_delay_secs: u64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_upload_url() -> String {
    DEFAULT_UPLOAD_URL.to_string()
}

fn default_folder() -> String {
    "/Backup".to_string()
}

fn default_keepfiles() -> usize {
    1
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            keepfiles: default_keepfiles(),
            exclude: Vec::new(),
            scratch_dir: default_scratch_dir(),
            archive_retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            upload_url: default_upload_url(),
            access_token: None,
            log_file: None,
            backup: BackupConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate the config file. A missing file at the default
    /// location yields the defaults.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_url.is_empty() {
            anyhow::bail!("api_url must not be empty");
        }
        if self.upload_url.is_empty() {
            anyhow::bail!("upload_url must not be empty");
        }
        self.backup.validate()
    }

    /// Bearer token from the environment, falling back to the config file.
    pub fn access_token(&self) -> anyhow::Result<String> {
        let from_env = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        match from_env.or_else(|| self.access_token.clone().filter(|t| !t.is_empty())) {
            Some(token) => Ok(token),
            None => anyhow::bail!("No access token: set {} or access_token in the config file", TOKEN_ENV),
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.folder.starts_with('/') {
            anyhow::bail!("backup.folder must be an absolute remote path: {}", self.folder);
        }
        if self.keepfiles < 1 {
            anyhow::bail!("backup.keepfiles must be at least 1");
        }
        for p in &self.exclude {
            if !p.is_absolute() {
                anyhow::bail!("backup.exclude must be absolute: {}", p.display());
            }
        }
        Ok(())
    }

    pub fn plan(&self) -> BackupPlan {
        BackupPlan {
            folder: self.folder.clone(),
            keepfiles: self.keepfiles,
            excludes: self.exclude.clone(),
            scratch_dir: self.scratch_dir.clone(),
            archive_retry_delay: Duration::from_secs(self.archive_retry_delay_secs),
        }
    }
}
