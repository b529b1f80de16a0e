//! Lifecycle engine seam
//!
//! The repository manager drives loading and unloading through this trait
//! and never assumes a concrete engine, mirroring the dependency-injection
//! seams the rest of the crate uses for testability. `LocalLifecycle` is
//! the in-process implementation; tests substitute scripted engines.

mod local;

pub use local::LocalLifecycle;

use crate::error::ManagerResult;
use crate::model::{ModelIdentifier, ModelInfo};
use crate::model_config::ModelConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Readiness of one model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelReadyState {
    Unknown,
    Loading,
    Ready,
    Unloading,
    Unavailable,
}

impl fmt::Display for ModelReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Loading => "LOADING",
            Self::Ready => "READY",
            Self::Unloading => "UNLOADING",
            Self::Unavailable => "UNAVAILABLE",
        };
        write!(f, "{s}")
    }
}

/// State and reason for one version of one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionState {
    pub state: ModelReadyState,
    /// Failure reason when the version is unusable, empty otherwise
    pub reason: String,
}

impl VersionState {
    pub fn ready() -> Self {
        Self {
            state: ModelReadyState::Ready,
            reason: String::new(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            state: ModelReadyState::Unavailable,
            reason: reason.into(),
        }
    }
}

/// version -> state for one model
pub type VersionStateMap = BTreeMap<i64, VersionState>;

/// model -> version -> state
pub type ModelStateMap = BTreeMap<ModelIdentifier, VersionStateMap>;

/// A loaded model as handed to inference callers.
///
/// Handles are reference counted; a clone held by an in-flight request
/// keeps the loaded model alive even after the model leaves the graph.
#[derive(Debug)]
pub struct LoadedModel {
    pub id: ModelIdentifier,
    pub version: i64,
    pub config: ModelConfig,
}

pub type ModelHandle = Arc<LoadedModel>;

/// Engine that owns the loaded models and their readiness tracking.
///
/// The manager calls the async mutators while holding its writer lock;
/// the read accessors back the manager's lock-free reader paths and must
/// be safe under concurrent mutation.
#[async_trait]
pub trait LifecycleEngine: Send + Sync {
    /// Load (or re-load) the model described by `info` and make its
    /// selected versions ready.
    async fn async_load(&self, id: &ModelIdentifier, info: &ModelInfo) -> ManagerResult<()>;

    /// Unload every version of the model. `NotFound` if it is not being
    /// served.
    async fn async_unload(&self, id: &ModelIdentifier) -> ManagerResult<()>;

    /// Stop accepting new inference work; in-flight handles stay valid.
    async fn stop_all(&self) -> ManagerResult<()>;

    /// Unload every model.
    async fn unload_all(&self) -> ManagerResult<()>;

    /// Obtain a handle on a ready version; `version < 0` selects the
    /// newest ready version.
    fn get_model(&self, id: &ModelIdentifier, version: i64) -> ManagerResult<ModelHandle>;

    /// States of live models. With `strict_readiness`, only models with at
    /// least one ready version count as live; otherwise loading and
    /// unloading models are included.
    fn live_model_states(&self, strict_readiness: bool) -> ModelStateMap;

    /// States of every model ever (attempted to be) loaded.
    fn model_states(&self) -> ModelStateMap;

    /// States of all versions of one model; empty map if unknown.
    fn version_states(&self, id: &ModelIdentifier) -> VersionStateMap;

    /// `(name, version, in-flight count)` for every version with at least
    /// one outstanding inference handle.
    fn inflight_status(&self) -> BTreeSet<(String, i64, usize)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_display() {
        assert_eq!(ModelReadyState::Ready.to_string(), "READY");
        assert_eq!(ModelReadyState::Unavailable.to_string(), "UNAVAILABLE");
        assert_eq!(ModelReadyState::Loading.to_string(), "LOADING");
    }

    #[test]
    fn test_version_state_constructors() {
        assert_eq!(VersionState::ready().state, ModelReadyState::Ready);
        let gone = VersionState::unavailable("unloaded");
        assert_eq!(gone.state, ModelReadyState::Unavailable);
        assert_eq!(gone.reason, "unloaded");
    }
}
