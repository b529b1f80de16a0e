//! Model configuration parsing
//!
//! Every model directory may carry a `config.json` describing the model's
//! platform, version policy, and (for ensembles) its scheduling steps. A
//! missing file autofills a leaf configuration from the directory name; an
//! unreadable or mismatched file is a per-model error that the poller folds
//! into its result instead of aborting the poll.

use crate::error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Platform string that marks a composite model
pub const ENSEMBLE_PLATFORM: &str = "ensemble";

/// Version placeholder meaning "whatever version is being served"
pub const ANY_VERSION: i64 = -1;

/// Which on-disk versions of a model should be served
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Serve the `num_versions` highest version numbers (default: 1)
    Latest { num_versions: u32 },
    /// Serve every version present on disk
    All,
    /// Serve exactly the listed versions
    Specific { versions: Vec<i64> },
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self::Latest { num_versions: 1 }
    }
}

impl VersionPolicy {
    /// Select the versions to serve out of the versions present on disk
    pub fn select(&self, available: &BTreeSet<i64>) -> BTreeSet<i64> {
        match self {
            Self::Latest { num_versions } => available
                .iter()
                .rev()
                .take(*num_versions as usize)
                .copied()
                .collect(),
            Self::All => available.clone(),
            Self::Specific { versions } => versions
                .iter()
                .filter(|v| available.contains(v))
                .copied()
                .collect(),
        }
    }
}

/// One step of an ensemble's scheduling pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleStep {
    /// Name of the composing model
    pub model_name: String,
    /// Required version of the composing model, -1 for any
    #[serde(default = "any_version")]
    pub model_version: i64,
}

fn any_version() -> i64 {
    ANY_VERSION
}

/// Ensemble scheduling configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub step: Vec<EnsembleStep>,
}

/// Parsed configuration of one model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name; when present it must match the (mapped) directory name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Backend platform, e.g. "onnxruntime_onnx" or "ensemble"
    #[serde(skip_serializing_if = "String::is_empty")]
    pub platform: String,

    /// Maximum batch size accepted by the model, 0 to disable batching
    pub max_batch_size: u32,

    /// Which on-disk versions to serve
    pub version_policy: VersionPolicy,

    /// Scheduling steps; present iff the model is an ensemble
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<EnsembleConfig>,

    /// Opaque backend parameters, passed through untouched
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl ModelConfig {
    /// Autofilled leaf configuration for a model directory without one
    pub fn autofill(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Whether this model composes other models
    pub fn is_ensemble(&self) -> bool {
        self.platform == ENSEMBLE_PLATFORM || self.ensemble.is_some()
    }

    /// Declared dependencies as `(model_name, required versions)` pairs.
    ///
    /// Steps naming the same model merge; a `-1` step contributes no
    /// version requirement (any served version satisfies it).
    pub fn dependencies(&self) -> Vec<(String, BTreeSet<i64>)> {
        let mut deps: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        if let Some(ensemble) = &self.ensemble {
            for step in &ensemble.step {
                let versions = deps.entry(step.model_name.clone()).or_default();
                if step.model_version != ANY_VERSION {
                    versions.insert(step.model_version);
                }
            }
        }
        deps.into_iter().collect()
    }
}

/// Parse and normalize the configuration for the model rooted at `path`.
///
/// `model_name` is the externally visible (mapped) name; a `name` field in
/// the file that disagrees with it is rejected. `inline` overrides the
/// on-disk file when the caller supplied a configuration directly.
pub fn parse_model_config(
    path: &Path,
    model_name: &str,
    inline: Option<&str>,
) -> ManagerResult<ModelConfig> {
    let mut config = match inline {
        Some(raw) => serde_json::from_str::<ModelConfig>(raw)?,
        None => {
            let config_path = path.join("config.json");
            if !config_path.exists() {
                return Ok(ModelConfig::autofill(model_name));
            }
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str::<ModelConfig>(&content)?
        }
    };

    if config.name.is_empty() {
        config.name = model_name.to_string();
    } else if config.name != model_name {
        return Err(ManagerError::invalid_argument(format!(
            "unexpected directory name '{model_name}' for model '{}'",
            config.name
        )));
    }

    if let Some(ensemble) = &config.ensemble {
        for step in &ensemble.step {
            if step.model_name.is_empty() {
                return Err(ManagerError::invalid_argument(format!(
                    "ensemble '{model_name}' contains a step without a model name"
                )));
            }
            if step.model_version != ANY_VERSION && step.model_version < 1 {
                return Err(ManagerError::invalid_argument(format!(
                    "ensemble '{model_name}' requests invalid version {} of model '{}'",
                    step.model_version, step.model_name
                )));
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
        std::fs::write(dir.path().join("config.json"), content).unwrap();
        dir.path().to_path_buf()
    }

    #[test]
    fn test_autofill_when_config_missing() {
        let dir = TempDir::new().unwrap();
        let config = parse_model_config(dir.path(), "resnet", None).unwrap();
        assert_eq!(config.name, "resnet");
        assert!(!config.is_ensemble());
        assert!(config.dependencies().is_empty());
    }

    #[test]
    fn test_parse_leaf_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{
                "platform": "onnxruntime_onnx",
                "max_batch_size": 8,
                "version_policy": { "latest": { "num_versions": 2 } }
            }"#,
        );

        let config = parse_model_config(&path, "resnet", None).unwrap();
        assert_eq!(config.platform, "onnxruntime_onnx");
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.version_policy, VersionPolicy::Latest { num_versions: 2 });
        assert!(!config.is_ensemble());
    }

    #[test]
    fn test_parse_ensemble_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{
                "platform": "ensemble",
                "ensemble": {
                    "step": [
                        { "model_name": "preprocess" },
                        { "model_name": "resnet", "model_version": 2 },
                        { "model_name": "resnet", "model_version": 3 }
                    ]
                }
            }"#,
        );

        let config = parse_model_config(&path, "pipeline", None).unwrap();
        assert!(config.is_ensemble());

        let deps = config.dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].0, "preprocess");
        assert!(deps[0].1.is_empty());
        assert_eq!(deps[1].0, "resnet");
        assert_eq!(deps[1].1, BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "name": "other" }"#);
        let err = parse_model_config(&path, "resnet", None).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_invalid_json_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{not json");
        assert!(parse_model_config(&path, "resnet", None).is_err());
    }

    #[test]
    fn test_inline_config_overrides_disk() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "max_batch_size": 1 }"#);
        let config =
            parse_model_config(&path, "resnet", Some(r#"{ "max_batch_size": 16 }"#)).unwrap();
        assert_eq!(config.max_batch_size, 16);
    }

    #[test]
    fn test_invalid_step_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{ "ensemble": { "step": [{ "model_name": "a", "model_version": 0 }] } }"#,
        );
        assert!(parse_model_config(&path, "pipeline", None).is_err());
    }

    #[test]
    fn test_version_policy_select() {
        let available = BTreeSet::from([1, 2, 5, 9]);

        let latest = VersionPolicy::Latest { num_versions: 2 };
        assert_eq!(latest.select(&available), BTreeSet::from([5, 9]));

        assert_eq!(VersionPolicy::All.select(&available), available);

        let specific = VersionPolicy::Specific { versions: vec![2, 7] };
        assert_eq!(specific.select(&available), BTreeSet::from([2]));
    }
}
