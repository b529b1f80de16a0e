//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// How the set of served models is controlled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Load everything found at startup; never change afterwards
    #[default]
    None,
    /// Load everything found at startup and on every `poll_and_update`
    Poll,
    /// Load and unload only what the operator asks for
    Explicit,
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "poll" => Ok(Self::Poll),
            "explicit" => Ok(Self::Explicit),
            other => Err(format!(
                "invalid model control mode '{other}' (expected none, poll, or explicit)"
            )),
        }
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Poll => write!(f, "poll"),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

/// Main manager configuration
///
/// Loaded from a TOML file, with environment variable overrides taking
/// precedence where noted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Filesystem roots of the model repositories
    /// Override via: MODEL_REPO_PATHS (colon separated)
    pub repository_paths: Vec<PathBuf>,

    /// Model control mode (default: none)
    /// Override via: MODEL_REPO_CONTROL_MODE
    pub control_mode: ControlMode,

    /// Models to load at startup when control mode is explicit
    /// (default: empty). Other modes load everything they find.
    pub startup_models: Vec<String>,

    /// Scope model identifiers by repository root (default: false)
    /// Two repositories may then carry the same model name.
    pub enable_model_namespacing: bool,

    /// Seconds between automatic repository polls in poll mode
    /// (default: 15)
    pub poll_interval_secs: u64,

    /// Maximum seconds to wait for one lifecycle load or unload call
    /// (default: 300). A hung backend load otherwise blocks every later
    /// writer operation.
    /// Override via: MODEL_REPO_LOAD_TIMEOUT
    pub load_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            repository_paths: Vec::new(),
            control_mode: ControlMode::default(),
            startup_models: Vec::new(),
            enable_model_namespacing: false,
            poll_interval_secs: default_poll_interval(),
            load_timeout_secs: default_load_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    15
}

fn default_load_timeout() -> u64 {
    300
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(paths) = std::env::var("MODEL_REPO_PATHS") {
            config.repository_paths = paths.split(':').map(PathBuf::from).collect();
        }
        if let Ok(mode) = std::env::var("MODEL_REPO_CONTROL_MODE") {
            config.control_mode = mode
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid MODEL_REPO_CONTROL_MODE value")?;
        }
        if let Ok(timeout) = std::env::var("MODEL_REPO_LOAD_TIMEOUT") {
            config.load_timeout_secs = timeout
                .parse()
                .context("Invalid MODEL_REPO_LOAD_TIMEOUT value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.repository_paths.is_empty() && self.control_mode != ControlMode::Explicit {
            anyhow::bail!(
                "at least one repository path is required in {} mode",
                self.control_mode
            );
        }
        if self.control_mode == ControlMode::Poll && self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be >= 1 in poll mode");
        }
        if self.load_timeout_secs == 0 {
            anyhow::bail!("load_timeout_secs must be >= 1");
        }
        if !self.startup_models.is_empty() && self.control_mode != ControlMode::Explicit {
            anyhow::bail!(
                "startup_models is only honored in explicit mode (got mode {})",
                self.control_mode
            );
        }
        for name in &self.startup_models {
            if name.is_empty() {
                anyhow::bail!("startup model names must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = ManagerConfig::default();
        config.repository_paths.push(PathBuf::from("/models"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_mode_requires_interval() {
        let config = ManagerConfig {
            repository_paths: vec![PathBuf::from("/models")],
            control_mode: ControlMode::Poll,
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_explicit_mode_requires_repository() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_err());

        let explicit = ManagerConfig {
            control_mode: ControlMode::Explicit,
            ..Default::default()
        };
        assert!(explicit.validate().is_ok());
    }

    #[test]
    fn test_startup_models_only_in_explicit_mode() {
        let config = ManagerConfig {
            repository_paths: vec![PathBuf::from("/models")],
            control_mode: ControlMode::Poll,
            startup_models: vec!["resnet".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_control_mode_parse_and_display() {
        assert_eq!("poll".parse::<ControlMode>().unwrap(), ControlMode::Poll);
        assert_eq!(
            "explicit".parse::<ControlMode>().unwrap(),
            ControlMode::Explicit
        );
        assert!("watch".parse::<ControlMode>().is_err());
        assert_eq!(ControlMode::None.to_string(), "none");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ManagerConfig {
            repository_paths: vec![PathBuf::from("/models/a"), PathBuf::from("/models/b")],
            control_mode: ControlMode::Explicit,
            startup_models: vec!["resnet".to_string()],
            enable_model_namespacing: true,
            poll_interval_secs: 30,
            load_timeout_secs: 120,
        };

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ManagerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.repository_paths, config.repository_paths);
        assert_eq!(parsed.control_mode, ControlMode::Explicit);
        assert_eq!(parsed.poll_interval_secs, 30);
    }
}
