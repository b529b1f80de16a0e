//! Model repository manager façade
//!
//! One instance owns the dependency graph, the model info store, and the
//! registered repository locations, and drives the lifecycle engine
//! through the poller, graph mutators, connector, and scheduler. Writer
//! operations (`poll_and_update`, `load_unload_model`, registration
//! changes, `unload_all_models`) serialize on a single mutex and apply in
//! invocation order; reader operations delegate to the lifecycle engine's
//! own concurrent structures and never contend with writers.

use crate::config::{ControlMode, ManagerConfig};
use crate::error::{ManagerError, ManagerResult};
use crate::graph::{connect_affected, DependencyGraph};
use crate::lifecycle::{LifecycleEngine, ModelHandle, ModelReadyState, ModelStateMap, VersionStateMap};
use crate::model::{ModelIdentifier, ModelInfoMap};
use crate::poller::{self, PollResult, PollScope, RepositoryLocations};
use crate::scheduler::{self, LoadResults};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Explicit model-control verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Load,
    Unload,
}

/// One row of the repository index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIndex {
    pub name: String,
    /// -1 for name-only rows (models known on disk but never loaded)
    pub version: i64,
    pub state: ModelReadyState,
    pub reason: String,
}

/// Graph and info store, writer-exclusive behind the poll mutex
#[derive(Default)]
struct WriterState {
    graph: DependencyGraph,
    infos: ModelInfoMap,
}

/// Registration state shared with lock-free-ish readers
#[derive(Default)]
struct LocationState {
    locations: RepositoryLocations,
    /// name -> reason for models visible on disk but excluded from the
    /// last poll (duplicates, parse failures)
    unpolled: BTreeMap<String, String>,
}

pub struct ModelRepositoryManager {
    mode: ControlMode,
    startup_models: BTreeSet<String>,
    load_timeout: Duration,
    lifecycle: Arc<dyn LifecycleEngine>,
    /// The writer lock (`poll_mu`): all graph and info mutation runs
    /// under it, for the full duration of the operation.
    state: Mutex<WriterState>,
    locations: RwLock<LocationState>,
}

impl ModelRepositoryManager {
    pub fn new(
        config: &ManagerConfig,
        lifecycle: Arc<dyn LifecycleEngine>,
    ) -> ManagerResult<Self> {
        config
            .validate()
            .map_err(|err| ManagerError::invalid_argument(err.to_string()))?;

        let locations = RepositoryLocations {
            repository_paths: config.repository_paths.iter().cloned().collect(),
            model_mappings: HashMap::new(),
            enable_namespacing: config.enable_model_namespacing,
        };

        Ok(Self {
            mode: config.control_mode,
            startup_models: config.startup_models.iter().cloned().collect(),
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            lifecycle,
            state: Mutex::new(WriterState::default()),
            locations: RwLock::new(LocationState {
                locations,
                unpolled: BTreeMap::new(),
            }),
        })
    }

    /// Startup pass: poll everything (Poll/None mode) or load the startup
    /// models (Explicit mode). Per-model failures are logged, not fatal.
    pub async fn init(&self) -> ManagerResult<()> {
        match self.mode {
            ControlMode::None | ControlMode::Poll => {
                let all_ok = self.poll_and_update_internal().await?;
                if !all_ok {
                    tracing::warn!("Not all models were polled successfully at startup");
                }
                Ok(())
            }
            ControlMode::Explicit => {
                if self.startup_models.is_empty() {
                    return Ok(());
                }
                let models: BTreeMap<String, BTreeMap<String, String>> = self
                    .startup_models
                    .iter()
                    .map(|name| (name.clone(), BTreeMap::new()))
                    .collect();
                match self.load_unload_model(models, ActionType::Load, false).await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to load startup models");
                        Err(err)
                    }
                }
            }
        }
    }

    /// Poll every registered repository and converge the served models on
    /// the new on-disk state. Returns whether every model polled cleanly.
    pub async fn poll_and_update(&self) -> ManagerResult<bool> {
        if self.mode != ControlMode::Poll {
            return Err(ManagerError::invalid_argument(
                "polling is not allowed: model control mode is not poll",
            ));
        }
        self.poll_and_update_internal().await
    }

    async fn poll_and_update_internal(&self) -> ManagerResult<bool> {
        let mut state = self.state.lock().await;
        let locations = self.locations.read().await.locations.clone();

        let mut result = poller::poll(&locations, &PollScope::AllRepositories, &state.infos);
        // In polling mode every served model counts as operator-requested
        // and is exempt from cascading collection.
        for info in result.infos.values_mut() {
            info.explicitly_load = true;
        }

        let all_ok = result.all_ok;
        let results = self.apply_changes(&mut state, result).await;
        for (model, verdict) in &results {
            if let Err(err) = verdict {
                tracing::warn!(model = %model, error = %err, "Model failed to converge");
            }
        }
        Ok(all_ok)
    }

    /// Load or unload the named models. LOAD polls the models and their
    /// ensemble dependencies to closure; UNLOAD removes them, cascading to
    /// now-unreferenced dependencies when `unload_dependents` is set.
    pub async fn load_unload_model(
        &self,
        models: BTreeMap<String, BTreeMap<String, String>>,
        action: ActionType,
        unload_dependents: bool,
    ) -> ManagerResult<LoadResults> {
        if self.mode != ControlMode::Explicit {
            return Err(ManagerError::invalid_argument(
                "explicit model load / unload is not allowed if polling is enabled",
            ));
        }
        if models.is_empty() {
            return Ok(LoadResults::new());
        }

        match action {
            ActionType::Load => self.load_models(models).await,
            ActionType::Unload => self.unload_models(models, unload_dependents).await,
        }
    }

    async fn load_models(
        &self,
        models: BTreeMap<String, BTreeMap<String, String>>,
    ) -> ManagerResult<LoadResults> {
        let mut state = self.state.lock().await;
        let locations = self.locations.read().await.locations.clone();
        let requested: BTreeSet<String> = models.keys().cloned().collect();

        // Poll the requested models, then iteratively pull in ensemble
        // dependencies that are not known yet.
        let mut merged = PollResult {
            all_ok: true,
            ..PollResult::default()
        };
        let mut polled_names = BTreeSet::new();
        let mut to_poll = models;
        while !to_poll.is_empty() {
            polled_names.extend(to_poll.keys().cloned());
            let result = poller::poll(&locations, &PollScope::Models(to_poll), &state.infos);

            let mut next: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
            for info in result.infos.values() {
                for (dep_name, _) in info.config.dependencies() {
                    let known = state
                        .infos
                        .keys()
                        .chain(result.infos.keys())
                        .any(|id| id.name == dep_name);
                    if !known && !polled_names.contains(&dep_name) {
                        next.insert(dep_name, BTreeMap::new());
                    }
                }
            }

            merge_poll_results(&mut merged, result);
            to_poll = next;
        }

        // A requested model that resolved to nothing is a caller error.
        for name in &requested {
            let polled = merged.infos.keys().any(|id| id.name == *name);
            if !polled {
                let reason = merged
                    .failed
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| "model not found".to_string());
                return Err(ManagerError::not_found(format!(
                    "failed to load '{name}': {reason}"
                )));
            }
        }

        // Requested models are explicitly loaded; dependencies keep any
        // explicit flag they already earned.
        for (id, info) in merged.infos.iter_mut() {
            info.explicitly_load = requested.contains(&id.name)
                || state
                    .infos
                    .get(id)
                    .is_some_and(|prior| prior.explicitly_load);
        }
        // An explicit load always re-dispatches, even for a model whose
        // on-disk state is unchanged.
        for id in merged.unmodified.clone() {
            if requested.contains(&id.name) {
                merged.unmodified.remove(&id);
                merged.modified.insert(id);
            }
        }

        let results = self.apply_changes(&mut state, merged).await;

        // Surface the first failure among the requested models.
        for name in &requested {
            let ids = state.graph.ids_with_name(name);
            for id in ids {
                if let Some(Err(err)) = results.get(&id.to_string()) {
                    return Err(ManagerError::internal(format!(
                        "failed to load '{name}': {err}"
                    )));
                }
            }
        }
        Ok(results)
    }

    async fn unload_models(
        &self,
        models: BTreeMap<String, BTreeMap<String, String>>,
        unload_dependents: bool,
    ) -> ManagerResult<LoadResults> {
        let mut state = self.state.lock().await;

        let mut ids = BTreeSet::new();
        for name in models.keys() {
            let matching = state.graph.ids_with_name(name);
            if matching.is_empty() {
                return Err(ManagerError::not_found(format!(
                    "explicit unload of model '{name}' which is not being served"
                )));
            }
            ids.extend(matching);
        }

        let (affected, removed) = state.graph.remove_nodes(&ids, unload_dependents);
        for id in &removed {
            state.infos.remove(id);
            if let Err(err) = self.lifecycle.async_unload(id).await
                && !matches!(err, ManagerError::NotFound(_))
            {
                tracing::warn!(model = %id, error = %err, "Unload reported an error");
            }
        }

        connect_affected(&mut state.graph, &affected);
        let WriterState { graph, infos } = &mut *state;
        let results = scheduler::load_by_dependency(
            graph,
            infos,
            self.lifecycle.as_ref(),
            &affected,
            self.load_timeout,
        )
        .await;
        Ok(results)
    }

    /// Apply a poll change-set to the info store and graph, re-validate
    /// the affected region, and schedule the resulting loads/unloads.
    async fn apply_changes(&self, state: &mut WriterState, result: PollResult) -> LoadResults {
        let PollResult {
            added,
            deleted,
            modified,
            infos: new_infos,
            failed,
            ..
        } = result;

        for id in &deleted {
            state.infos.remove(id);
        }
        for (id, info) in new_infos {
            state.infos.insert(id, info);
        }

        let (removed_affected, removed) = state.graph.remove_nodes(&deleted, false);
        let added_affected = state.graph.add_nodes(&added, &state.infos);
        let updated_affected = state.graph.update_nodes(&modified, &state.infos);

        let mut affected: BTreeSet<ModelIdentifier> = BTreeSet::new();
        affected.extend(removed_affected);
        affected.extend(added_affected);
        affected.extend(updated_affected);
        for id in &removed {
            affected.remove(id);
        }

        // Deleted models are gone from the graph; unload them directly.
        for id in &removed {
            if let Err(err) = self.lifecycle.async_unload(id).await
                && !matches!(err, ManagerError::NotFound(_))
            {
                tracing::warn!(model = %id, error = %err, "Unload reported an error");
            }
        }

        connect_affected(&mut state.graph, &affected);

        let WriterState { graph, infos } = state;
        let results = scheduler::load_by_dependency(
            graph,
            infos,
            self.lifecycle.as_ref(),
            &affected,
            self.load_timeout,
        )
        .await;

        self.locations.write().await.unpolled = failed;
        results
    }

    /// Unload every model and forget the graph.
    pub async fn unload_all_models(&self) -> ManagerResult<()> {
        let mut state = self.state.lock().await;
        state.graph = DependencyGraph::new();
        state.infos.clear();
        self.lifecycle.unload_all().await
    }

    /// Stop accepting new inference requests; in-flight work completes.
    pub async fn stop_all_models(&self) -> ManagerResult<()> {
        self.lifecycle.stop_all().await
    }

    /// Register a repository path with optional name->subdirectory
    /// mappings. No implicit poll happens; the caller follows up with
    /// `poll_and_update` or an explicit load.
    pub async fn register_model_repository(
        &self,
        repository: PathBuf,
        mapping: HashMap<String, String>,
    ) -> ManagerResult<()> {
        if self.mode == ControlMode::None {
            return Err(ManagerError::unavailable(
                "repository registration is not allowed: models would never be re-polled",
            ));
        }
        // Serialize with in-flight polls and loads.
        let _state = self.state.lock().await;
        let mut locations = self.locations.write().await;

        if locations.locations.repository_paths.contains(&repository) {
            return Err(ManagerError::already_exists(format!(
                "model repository '{}' has already been registered",
                repository.display()
            )));
        }
        for name in mapping.keys() {
            if locations.locations.model_mappings.contains_key(name) {
                return Err(ManagerError::already_exists(format!(
                    "model mapping for '{name}' has already been registered"
                )));
            }
        }

        for (name, subdir) in mapping {
            let path = repository.join(&subdir);
            locations
                .locations
                .model_mappings
                .insert(name, (repository.clone(), path));
        }
        locations.locations.repository_paths.insert(repository.clone());

        tracing::info!(repository = %repository.display(), "Model repository registered");
        Ok(())
    }

    /// Unregister a repository path and its mappings. Models already
    /// loaded from it stay loaded until unloaded or re-polled.
    pub async fn unregister_model_repository(&self, repository: &Path) -> ManagerResult<()> {
        if self.mode == ControlMode::None {
            return Err(ManagerError::unavailable(
                "repository registration is not allowed: models would never be re-polled",
            ));
        }
        let _state = self.state.lock().await;
        let mut locations = self.locations.write().await;

        if !locations.locations.repository_paths.remove(repository) {
            return Err(ManagerError::not_found(format!(
                "failed to unregister model repository '{}': repository not found",
                repository.display()
            )));
        }
        locations
            .locations
            .model_mappings
            .retain(|_, (repo, _)| repo != repository);

        tracing::info!(repository = %repository.display(), "Model repository unregistered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Readers: delegate to the lifecycle engine, no writer lock taken.
    // ------------------------------------------------------------------

    /// Obtain an inference handle for `name`. The name is resolved in the
    /// global namespace first, then across namespaces when unique.
    pub fn get_model(&self, name: &str, version: i64) -> ManagerResult<ModelHandle> {
        let id = self.resolve_served_name(name)?;
        self.lifecycle.get_model(&id, version)
    }

    /// Obtain an inference handle by exact identifier.
    pub fn get_model_by_id(
        &self,
        id: &ModelIdentifier,
        version: i64,
    ) -> ManagerResult<ModelHandle> {
        self.lifecycle.get_model(id, version)
    }

    /// Ready-state of one model version.
    pub fn model_state(&self, name: &str, version: i64) -> ManagerResult<ModelReadyState> {
        let id = self.resolve_served_name(name)?;
        let states = self.lifecycle.version_states(&id);
        states
            .get(&version)
            .map(|vs| vs.state)
            .ok_or_else(|| {
                ManagerError::not_found(format!("version {version} of model '{name}' is unknown"))
            })
    }

    /// States of all versions of one model.
    pub fn version_states(&self, name: &str) -> ManagerResult<VersionStateMap> {
        let id = self.resolve_served_name(name)?;
        Ok(self.lifecycle.version_states(&id))
    }

    pub fn live_model_states(&self, strict_readiness: bool) -> ModelStateMap {
        self.lifecycle.live_model_states(strict_readiness)
    }

    pub fn model_states(&self) -> ModelStateMap {
        self.lifecycle.model_states()
    }

    pub fn inflight_status(&self) -> BTreeSet<(String, i64, usize)> {
        self.lifecycle.inflight_status()
    }

    /// Index of every model in every repository, merged with the
    /// lifecycle engine's view. Models on disk that the engine does not
    /// know are reported name-only as `UNAVAILABLE`, carrying the reason
    /// recorded at poll time (duplicate names, parse failures).
    pub async fn repository_index(&self, ready_only: bool) -> ManagerResult<Vec<ModelIndex>> {
        let mut index = Vec::new();
        let mut known_names = BTreeSet::new();

        for (id, versions) in self.lifecycle.model_states() {
            known_names.insert(id.name.clone());
            for (version, vs) in versions {
                if ready_only && vs.state != ModelReadyState::Ready {
                    continue;
                }
                index.push(ModelIndex {
                    name: id.name.clone(),
                    version,
                    state: vs.state,
                    reason: vs.reason,
                });
            }
        }

        if !ready_only {
            let locations = self.locations.read().await;
            let mut on_disk = BTreeSet::new();
            for repository in &locations.locations.repository_paths {
                if locations.locations.repository_has_mappings(repository) {
                    continue;
                }
                match poller::list_repository(repository) {
                    Ok(entries) => on_disk.extend(entries.into_iter().map(|(name, _)| name)),
                    Err(err) => {
                        tracing::warn!(
                            repository = %repository.display(),
                            error = %err,
                            "Failed to enumerate repository for index"
                        );
                    }
                }
            }
            on_disk.extend(locations.locations.model_mappings.keys().cloned());

            for name in on_disk {
                if !known_names.contains(&name) {
                    index.push(ModelIndex {
                        name: name.clone(),
                        version: -1,
                        state: ModelReadyState::Unavailable,
                        reason: locations.unpolled.get(&name).cloned().unwrap_or_default(),
                    });
                }
            }
        }

        index.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
        Ok(index)
    }

    /// Resolve a bare model name to a served identifier: the global
    /// namespace wins, otherwise the name must be unique across
    /// namespaces.
    fn resolve_served_name(&self, name: &str) -> ManagerResult<ModelIdentifier> {
        let global = ModelIdentifier::global(name);
        let states = self.lifecycle.model_states();
        if states.contains_key(&global) {
            return Ok(global);
        }
        let matching: Vec<&ModelIdentifier> =
            states.keys().filter(|id| id.name == name).collect();
        match matching.as_slice() {
            [] => Err(ManagerError::not_found(format!(
                "model '{name}' is not being served"
            ))),
            [id] => Ok((*id).clone()),
            _ => Err(ManagerError::invalid_argument(format!(
                "model '{name}' exists in more than one namespace"
            ))),
        }
    }
}

fn merge_poll_results(merged: &mut PollResult, result: PollResult) {
    merged.added.extend(result.added);
    merged.deleted.extend(result.deleted);
    merged.modified.extend(result.modified);
    merged.unmodified.extend(result.unmodified);
    merged.infos.extend(result.infos);
    merged.failed.extend(result.failed);
    merged.all_ok &= result.all_ok;
}
