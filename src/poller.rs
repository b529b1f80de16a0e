//! Repository polling and change-set computation
//!
//! The poller compares the current on-disk state of the registered model
//! repositories against the manager's info store and reports what was
//! added, deleted, modified, or left untouched. It never fails as a whole:
//! every per-model problem is recorded in `PollResult::failed` and folded
//! into `all_ok = false`, and the previous `ModelInfo` for such a model is
//! left in place.

use crate::error::ManagerResult;
use crate::model::{ModelIdentifier, ModelInfo, ModelInfoMap};
use crate::model_config::parse_model_config;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Ready-reason reported for a model found in more than one repository
/// while namespacing is disabled
pub const READY_REASON_DUPLICATE: &str = "model appears in two or more repositories";

/// Parameter key selecting an out-of-repository model directory
pub const PARAM_DIRECTORY_OVERRIDE: &str = "model_directory_override";

/// Parameter key carrying an inline JSON model configuration
pub const PARAM_CONFIG_OVERRIDE: &str = "config";

/// Where models may be polled from, snapshotted by the manager
#[derive(Debug, Clone, Default)]
pub struct RepositoryLocations {
    /// Registered repository roots
    pub repository_paths: BTreeSet<PathBuf>,
    /// Overridden model names mapped to `(repository, model directory)`;
    /// a repository with mappings exposes only its mapped models
    pub model_mappings: HashMap<String, (PathBuf, PathBuf)>,
    /// When true, identifiers are namespaced by repository root
    pub enable_namespacing: bool,
}

impl RepositoryLocations {
    fn namespace_for(&self, repository: &Path) -> String {
        if self.enable_namespacing {
            repository.display().to_string()
        } else {
            String::new()
        }
    }

    pub(crate) fn repository_has_mappings(&self, repository: &Path) -> bool {
        self.model_mappings
            .values()
            .any(|(repo, _)| repo == repository)
    }
}

/// What a single poll should look at
#[derive(Debug, Clone)]
pub enum PollScope {
    /// Every model of every registered repository (polling mode)
    AllRepositories,
    /// Only the named models, each with its load parameters (explicit mode)
    Models(BTreeMap<String, BTreeMap<String, String>>),
}

/// Change-set produced by one poll
#[derive(Debug, Default)]
pub struct PollResult {
    pub added: BTreeSet<ModelIdentifier>,
    pub deleted: BTreeSet<ModelIdentifier>,
    pub modified: BTreeSet<ModelIdentifier>,
    pub unmodified: BTreeSet<ModelIdentifier>,
    /// Fresh infos for every successfully polled model (unmodified models
    /// carry their retained prior info)
    pub infos: ModelInfoMap,
    /// Per-name failure reasons: duplicates, parse errors, missing models
    pub failed: BTreeMap<String, String>,
    /// False iff any per-model failure occurred
    pub all_ok: bool,
}

/// Poll the requested scope and classify every model against `existing`.
pub fn poll(
    locations: &RepositoryLocations,
    scope: &PollScope,
    existing: &ModelInfoMap,
) -> PollResult {
    let mut result = PollResult {
        all_ok: true,
        ..PollResult::default()
    };

    let candidates = gather_candidates(locations, scope, &mut result);

    for (id, candidate) in &candidates {
        let mtime_ns = match latest_mtime_ns(&candidate.path) {
            Ok(ns) => ns,
            Err(err) => {
                record_failure(&mut result, &id.name, format!("failed to stat: {err}"));
                continue;
            }
        };

        let prior = existing.get(id);
        let inline_config = candidate.params.get(PARAM_CONFIG_OVERRIDE);

        // Unchanged on disk and no inline override: retain the prior info
        // without re-reading the configuration.
        if let Some(prior) = prior
            && prior.mtime_ns == mtime_ns
            && inline_config.is_none()
        {
            result.unmodified.insert(id.clone());
            result.infos.insert(id.clone(), prior.clone());
            continue;
        }

        let config =
            match parse_model_config(&candidate.path, &id.name, inline_config.map(String::as_str))
            {
                Ok(config) => config,
                Err(err) => {
                    record_failure(&mut result, &id.name, err.to_string());
                    continue;
                }
            };

        let mut info = ModelInfo::new(config, candidate.path.clone(), mtime_ns);
        info.agent_params = candidate
            .params
            .iter()
            .filter(|(k, _)| k.as_str() != PARAM_DIRECTORY_OVERRIDE)
            .filter(|(k, _)| k.as_str() != PARAM_CONFIG_OVERRIDE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if prior.is_some() {
            result.modified.insert(id.clone());
        } else {
            result.added.insert(id.clone());
        }
        result.infos.insert(id.clone(), info);
    }

    // Deleted: previously known models inside the scope that no longer
    // resolve to a directory.
    for id in existing.keys() {
        let in_scope = match scope {
            PollScope::AllRepositories => true,
            PollScope::Models(models) => models.contains_key(&id.name),
        };
        if in_scope && !candidates.contains_key(id) && !result.failed.contains_key(&id.name) {
            result.deleted.insert(id.clone());
        }
    }

    result
}

struct Candidate {
    path: PathBuf,
    params: BTreeMap<String, String>,
}

fn record_failure(result: &mut PollResult, name: &str, reason: String) {
    tracing::warn!(model = %name, reason = %reason, "Model excluded from poll");
    result.failed.insert(name.to_string(), reason);
    result.all_ok = false;
}

/// Resolve the scope to `identifier -> model directory`, flagging name
/// collisions across repositories when namespacing is off.
fn gather_candidates(
    locations: &RepositoryLocations,
    scope: &PollScope,
    result: &mut PollResult,
) -> HashMap<ModelIdentifier, Candidate> {
    // name -> (identifier, directory, params) gathered before collision checks
    type Gathered = HashMap<String, Vec<(ModelIdentifier, PathBuf, BTreeMap<String, String>)>>;
    let mut by_name: Gathered = HashMap::new();

    fn add(
        by_name: &mut Gathered,
        locations: &RepositoryLocations,
        repository: &Path,
        name: &str,
        path: PathBuf,
        params: BTreeMap<String, String>,
    ) {
        let id = ModelIdentifier::new(locations.namespace_for(repository), name);
        by_name.entry(name.to_string()).or_default().push((id, path, params));
    }

    match scope {
        PollScope::AllRepositories => {
            for repository in &locations.repository_paths {
                if locations.repository_has_mappings(repository) {
                    continue;
                }
                match list_repository(repository) {
                    Ok(entries) => {
                        for (name, path) in entries {
                            add(&mut by_name, locations, repository, &name, path, BTreeMap::new());
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            repository = %repository.display(),
                            error = %err,
                            "Failed to enumerate repository"
                        );
                        result.all_ok = false;
                    }
                }
            }
            for (name, (repository, path)) in &locations.model_mappings {
                add(&mut by_name, locations, repository, name, path.clone(), BTreeMap::new());
            }
        }
        PollScope::Models(models) => {
            for (name, params) in models {
                if name.is_empty() {
                    record_failure(result, name, "model name must not be empty".to_string());
                    continue;
                }
                if let Some(override_path) = params.get(PARAM_DIRECTORY_OVERRIDE) {
                    // Accepted without touching any repository.
                    add(
                        &mut by_name,
                        locations,
                        Path::new(""),
                        name,
                        PathBuf::from(override_path),
                        params.clone(),
                    );
                    continue;
                }
                let mut found = false;
                if let Some((repository, path)) = locations.model_mappings.get(name) {
                    add(&mut by_name, locations, repository, name, path.clone(), params.clone());
                    found = true;
                } else {
                    for repository in &locations.repository_paths {
                        if locations.repository_has_mappings(repository) {
                            continue;
                        }
                        let path = repository.join(name);
                        if path.is_dir() {
                            add(&mut by_name, locations, repository, name, path, params.clone());
                            found = true;
                        }
                    }
                }
                if !found {
                    record_failure(
                        result,
                        name,
                        format!("model '{name}' is not found in any model repository"),
                    );
                }
            }
        }
    }

    let mut candidates = HashMap::new();
    for (name, mut entries) in by_name {
        // Same name from several repositories: distinct identifiers when
        // namespacing is on, fatal for the name when it is off.
        if entries.len() > 1 && !locations.enable_namespacing {
            record_failure(result, &name, READY_REASON_DUPLICATE.to_string());
            continue;
        }
        for (id, path, params) in entries.drain(..) {
            candidates.insert(id, Candidate { path, params });
        }
    }
    candidates
}

/// Enumerate model subdirectories of a repository root.
///
/// The on-disk contract: one subdirectory per model, numeric version
/// subdirectories below it. Hidden directories are skipped.
pub fn list_repository(repository: &Path) -> ManagerResult<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(repository)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.is_empty() || name.starts_with('.') {
            continue;
        }
        entries.push((name, entry.path()));
    }
    Ok(entries)
}

/// Newest modification time under `path`, in nanoseconds since the epoch.
fn latest_mtime_ns(path: &Path) -> ManagerResult<u128> {
    let meta = std::fs::metadata(path)?;
    let mut latest = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            latest = latest.max(latest_mtime_ns(&entry.path())?);
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_model(repo: &Path, name: &str, version: i64) {
        let dir = repo.join(name).join(version.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("model.bin"), b"weights").unwrap();
    }

    fn locations(repos: &[&Path], namespacing: bool) -> RepositoryLocations {
        RepositoryLocations {
            repository_paths: repos.iter().map(|p| p.to_path_buf()).collect(),
            model_mappings: HashMap::new(),
            enable_namespacing: namespacing,
        }
    }

    #[test]
    fn test_initial_poll_reports_added() {
        let repo = TempDir::new().unwrap();
        make_model(repo.path(), "resnet", 1);
        make_model(repo.path(), "bert", 1);

        let result = poll(
            &locations(&[repo.path()], false),
            &PollScope::AllRepositories,
            &ModelInfoMap::new(),
        );

        assert!(result.all_ok);
        assert_eq!(result.added.len(), 2);
        assert!(result.added.contains(&ModelIdentifier::global("resnet")));
        assert!(result.deleted.is_empty());
        assert_eq!(result.infos.len(), 2);
    }

    #[test]
    fn test_repoll_without_change_is_unmodified() {
        let repo = TempDir::new().unwrap();
        make_model(repo.path(), "resnet", 1);
        let locs = locations(&[repo.path()], false);

        let first = poll(&locs, &PollScope::AllRepositories, &ModelInfoMap::new());
        let second = poll(&locs, &PollScope::AllRepositories, &first.infos);

        assert!(second.added.is_empty());
        assert!(second.modified.is_empty());
        assert_eq!(second.unmodified.len(), 1);
    }

    #[test]
    fn test_deleted_model_reported() {
        let repo = TempDir::new().unwrap();
        make_model(repo.path(), "resnet", 1);
        let locs = locations(&[repo.path()], false);
        let first = poll(&locs, &PollScope::AllRepositories, &ModelInfoMap::new());

        fs::remove_dir_all(repo.path().join("resnet")).unwrap();
        let second = poll(&locs, &PollScope::AllRepositories, &first.infos);

        assert_eq!(second.deleted.len(), 1);
        assert!(second.deleted.contains(&ModelIdentifier::global("resnet")));
    }

    #[test]
    fn test_duplicate_across_repositories_without_namespacing() {
        let repo1 = TempDir::new().unwrap();
        let repo2 = TempDir::new().unwrap();
        make_model(repo1.path(), "resnet", 1);
        make_model(repo2.path(), "resnet", 1);

        let result = poll(
            &locations(&[repo1.path(), repo2.path()], false),
            &PollScope::AllRepositories,
            &ModelInfoMap::new(),
        );

        assert!(!result.all_ok);
        assert!(result.added.is_empty());
        assert_eq!(
            result.failed.get("resnet").map(String::as_str),
            Some(READY_REASON_DUPLICATE)
        );
    }

    #[test]
    fn test_duplicate_allowed_with_namespacing() {
        let repo1 = TempDir::new().unwrap();
        let repo2 = TempDir::new().unwrap();
        make_model(repo1.path(), "resnet", 1);
        make_model(repo2.path(), "resnet", 1);

        let result = poll(
            &locations(&[repo1.path(), repo2.path()], true),
            &PollScope::AllRepositories,
            &ModelInfoMap::new(),
        );

        assert!(result.all_ok);
        assert_eq!(result.added.len(), 2);
        let namespaces: BTreeSet<_> =
            result.added.iter().map(|id| id.namespace.clone()).collect();
        assert_eq!(namespaces.len(), 2);
    }

    #[test]
    fn test_parse_failure_is_isolated() {
        let repo = TempDir::new().unwrap();
        make_model(repo.path(), "good", 1);
        make_model(repo.path(), "bad", 1);
        fs::write(repo.path().join("bad").join("config.json"), "{broken").unwrap();

        let result = poll(
            &locations(&[repo.path()], false),
            &PollScope::AllRepositories,
            &ModelInfoMap::new(),
        );

        assert!(!result.all_ok);
        assert_eq!(result.added.len(), 1);
        assert!(result.added.contains(&ModelIdentifier::global("good")));
        assert!(result.failed.contains_key("bad"));
    }

    #[test]
    fn test_explicit_scope_misses_unknown_model() {
        let repo = TempDir::new().unwrap();
        make_model(repo.path(), "resnet", 1);

        let mut models = BTreeMap::new();
        models.insert("ghost".to_string(), BTreeMap::new());
        let result = poll(
            &locations(&[repo.path()], false),
            &PollScope::Models(models),
            &ModelInfoMap::new(),
        );

        assert!(!result.all_ok);
        assert!(result.failed.contains_key("ghost"));
        assert!(result.infos.is_empty());
    }

    #[test]
    fn test_directory_override_skips_repositories() {
        let outside = TempDir::new().unwrap();
        make_model(outside.path(), "custom", 1);

        let mut params = BTreeMap::new();
        params.insert(
            PARAM_DIRECTORY_OVERRIDE.to_string(),
            outside.path().join("custom").display().to_string(),
        );
        params.insert("checksum".to_string(), "abc123".to_string());
        let mut models = BTreeMap::new();
        models.insert("custom".to_string(), params);

        let result = poll(
            &RepositoryLocations::default(),
            &PollScope::Models(models),
            &ModelInfoMap::new(),
        );

        assert!(result.all_ok, "failed: {:?}", result.failed);
        let info = result.infos.get(&ModelIdentifier::global("custom")).unwrap();
        assert_eq!(info.source_path, outside.path().join("custom"));
        assert_eq!(info.agent_params.get("checksum").map(String::as_str), Some("abc123"));
        assert!(!info.agent_params.contains_key(PARAM_DIRECTORY_OVERRIDE));
    }

    #[test]
    fn test_mapping_hides_unmapped_models() {
        let repo = TempDir::new().unwrap();
        make_model(repo.path(), "hidden", 1);
        make_model(repo.path(), "exposed", 1);

        let mut locs = locations(&[repo.path()], false);
        locs.model_mappings.insert(
            "alias".to_string(),
            (repo.path().to_path_buf(), repo.path().join("exposed")),
        );

        let result = poll(&locs, &PollScope::AllRepositories, &ModelInfoMap::new());

        assert_eq!(result.added.len(), 1);
        assert!(result.added.contains(&ModelIdentifier::global("alias")));
    }
}
