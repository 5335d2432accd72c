use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Operational settings for one deployed unit.
///
/// Loaded from `.ncdeploy/config.yaml`; every field has a default so a
/// missing file or a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    /// Defaults to `<app_dir>/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_web_user")]
    pub web_user: String,
    #[serde(default = "default_web_user")]
    pub web_group: String,
    #[serde(default = "default_web_service")]
    pub web_service: String,
    #[serde(default = "default_php")]
    pub php: PathBuf,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_apache_modules")]
    pub apache_modules: Vec<String>,
    #[serde(default = "default_storage_name")]
    pub storage_name: String,
    #[serde(default = "default_data_mode")]
    pub data_mode: u32,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Sweep budget per registered action before a pass is declared divergent.
    #[serde(default = "default_sweep_factor")]
    pub sweep_factor: usize,
    #[serde(default)]
    pub application_version: Option<String>,
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("/var/www/nextcloud")
}

fn default_web_user() -> String {
    "www-data".to_string()
}

fn default_web_service() -> String {
    "apache2".to_string()
}

fn default_php() -> PathBuf {
    PathBuf::from("/usr/bin/php")
}

fn default_http_port() -> u16 {
    80
}

fn default_apache_modules() -> Vec<String> {
    ["rewrite", "headers", "env", "dir", "mime"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_storage_name() -> String {
    "data".to_string()
}

fn default_data_mode() -> u32 {
    0o700
}

fn default_command_timeout() -> u64 {
    600
}

fn default_sweep_factor() -> usize {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            data_dir: None,
            web_user: default_web_user(),
            web_group: default_web_user(),
            web_service: default_web_service(),
            php: default_php(),
            http_port: default_http_port(),
            apache_modules: default_apache_modules(),
            storage_name: default_storage_name(),
            data_mode: default_data_mode(),
            command_timeout_secs: default_command_timeout(),
            sweep_factor: default_sweep_factor(),
            application_version: None,
        }
    }
}

impl Settings {
    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_yaml::from_str(&data)?;
        Ok(settings)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.app_dir.join("data"))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Sweep limit for a registry of `actions` entries.
    pub fn max_sweeps(&self, actions: usize) -> usize {
        self.sweep_factor.saturating_mul(actions).max(1)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.command_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "command_timeout_secs is 0: every external command would time out"
                    .to_string(),
            });
        }

        if self.sweep_factor == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "sweep_factor is 0: passes are limited to a single sweep".to_string(),
            });
        }

        for (field, path) in [("app_dir", &self.app_dir), ("php", &self.php)] {
            if path.is_relative() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("{field} '{}' is relative", path.display()),
                });
            }
        }

        let data_dir = self.data_dir();
        if !data_dir.starts_with(&self.app_dir) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "data_dir '{}' is outside app_dir '{}'",
                    data_dir.display(),
                    self.app_dir.display()
                ),
            });
        }

        if self.data_mode > 0o777 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("data_mode {:o} is not a permission mode", self.data_mode),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
