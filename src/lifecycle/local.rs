//! In-process lifecycle engine
//!
//! Serves models straight out of their repository directories: a load
//! discovers the numeric version subdirectories, applies the model's
//! version policy, and publishes ready versions with reference-counted
//! handles. State lives in a `DashMap` so the manager's reader paths stay
//! lock-free under concurrent writer activity.

use super::{
    LifecycleEngine, LoadedModel, ModelHandle, ModelReadyState, ModelStateMap, VersionState,
    VersionStateMap,
};
use crate::error::{ManagerError, ManagerResult};
use crate::model::{ModelIdentifier, ModelInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct VersionRecord {
    state: ModelReadyState,
    reason: String,
    handle: Option<ModelHandle>,
}

#[derive(Debug, Default)]
struct ModelRecord {
    versions: BTreeMap<i64, VersionRecord>,
}

impl ModelRecord {
    fn state_map(&self) -> VersionStateMap {
        self.versions
            .iter()
            .map(|(version, record)| {
                (
                    *version,
                    VersionState {
                        state: record.state,
                        reason: record.reason.clone(),
                    },
                )
            })
            .collect()
    }

    fn retire(&mut self, reason: &str) {
        for record in self.versions.values_mut() {
            record.state = ModelReadyState::Unavailable;
            record.reason = reason.to_string();
            record.handle = None;
        }
    }
}

/// DashMap-backed engine serving models from their on-disk directories
pub struct LocalLifecycle {
    models: DashMap<ModelIdentifier, ModelRecord>,
    serving: AtomicBool,
}

impl Default for LocalLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLifecycle {
    pub fn new() -> Self {
        Self {
            models: DashMap::new(),
            serving: AtomicBool::new(true),
        }
    }

    /// Numeric version subdirectories under a model directory
    fn versions_on_disk(path: &Path) -> ManagerResult<BTreeSet<i64>> {
        let mut versions = BTreeSet::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(version) = entry.file_name().to_string_lossy().parse::<i64>()
                && version > 0
            {
                versions.insert(version);
            }
        }
        Ok(versions)
    }
}

#[async_trait]
impl LifecycleEngine for LocalLifecycle {
    async fn async_load(&self, id: &ModelIdentifier, info: &ModelInfo) -> ManagerResult<()> {
        let available = Self::versions_on_disk(&info.source_path).map_err(|err| {
            ManagerError::internal(format!(
                "failed to enumerate versions of '{id}' under '{}': {err}",
                info.source_path.display()
            ))
        })?;
        if available.is_empty() {
            let err = ManagerError::invalid_argument(format!(
                "failed to load '{id}': at least one version must be available under '{}'",
                info.source_path.display()
            ));
            self.models
                .entry(id.clone())
                .or_default()
                .retire(&err.to_string());
            return Err(err);
        }

        let selected = info.config.version_policy.select(&available);
        if selected.is_empty() {
            let err = ManagerError::invalid_argument(format!(
                "failed to load '{id}': version policy selected no version out of {available:?}"
            ));
            self.models
                .entry(id.clone())
                .or_default()
                .retire(&err.to_string());
            return Err(err);
        }

        let mut record = self.models.entry(id.clone()).or_default();
        // Versions dropped by the new policy are retired; selected ones
        // are (re-)published with fresh handles.
        for (version, vrecord) in record.versions.iter_mut() {
            if !selected.contains(version) {
                vrecord.state = ModelReadyState::Unavailable;
                vrecord.reason = "unloaded".to_string();
                vrecord.handle = None;
            }
        }
        for version in &selected {
            record.versions.insert(
                *version,
                VersionRecord {
                    state: ModelReadyState::Ready,
                    reason: String::new(),
                    handle: Some(Arc::new(LoadedModel {
                        id: id.clone(),
                        version: *version,
                        config: info.config.clone(),
                    })),
                },
            );
        }

        tracing::info!(
            model = %id,
            versions = ?selected,
            "Model loaded"
        );
        Ok(())
    }

    async fn async_unload(&self, id: &ModelIdentifier) -> ManagerResult<()> {
        let Some(mut record) = self.models.get_mut(id) else {
            return Err(ManagerError::not_found(format!(
                "model '{id}' is not being served"
            )));
        };
        let had_ready = record
            .versions
            .values()
            .any(|v| v.state == ModelReadyState::Ready);
        record.retire("unloaded");
        drop(record);

        if had_ready {
            tracing::info!(model = %id, "Model unloaded");
        }
        Ok(())
    }

    async fn stop_all(&self) -> ManagerResult<()> {
        self.serving.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new inference requests");
        Ok(())
    }

    async fn unload_all(&self) -> ManagerResult<()> {
        for mut entry in self.models.iter_mut() {
            entry.value_mut().retire("unloaded");
        }
        tracing::info!("All models unloaded");
        Ok(())
    }

    fn get_model(&self, id: &ModelIdentifier, version: i64) -> ManagerResult<ModelHandle> {
        if !self.serving.load(Ordering::SeqCst) {
            return Err(ManagerError::unavailable(
                "server is not accepting new inference requests",
            ));
        }
        let Some(record) = self.models.get(id) else {
            return Err(ManagerError::not_found(format!(
                "model '{id}' is not being served"
            )));
        };

        let picked = if version < 0 {
            record
                .versions
                .iter()
                .rev()
                .find(|(_, v)| v.state == ModelReadyState::Ready)
        } else {
            record
                .versions
                .get_key_value(&version)
                .filter(|(_, v)| v.state == ModelReadyState::Ready)
        };

        match picked.and_then(|(_, v)| v.handle.clone()) {
            Some(handle) => Ok(handle),
            None => Err(ManagerError::unavailable(format!(
                "model '{id}' has no ready version matching {version}"
            ))),
        }
    }

    fn live_model_states(&self, strict_readiness: bool) -> ModelStateMap {
        self.models
            .iter()
            .filter(|entry| {
                entry.value().versions.values().any(|v| match v.state {
                    ModelReadyState::Ready => true,
                    ModelReadyState::Loading | ModelReadyState::Unloading => !strict_readiness,
                    _ => false,
                })
            })
            .map(|entry| (entry.key().clone(), entry.value().state_map()))
            .collect()
    }

    fn model_states(&self) -> ModelStateMap {
        self.models
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state_map()))
            .collect()
    }

    fn version_states(&self, id: &ModelIdentifier) -> VersionStateMap {
        self.models
            .get(id)
            .map(|record| record.state_map())
            .unwrap_or_default()
    }

    fn inflight_status(&self) -> BTreeSet<(String, i64, usize)> {
        let mut stats = BTreeSet::new();
        for entry in self.models.iter() {
            for (version, record) in &entry.value().versions {
                if let Some(handle) = &record.handle {
                    // One reference is our own copy; the rest are in flight.
                    let count = Arc::strong_count(handle) - 1;
                    if count > 0 {
                        stats.insert((entry.key().name.clone(), *version, count));
                    }
                }
            }
        }
        stats
    }
}
