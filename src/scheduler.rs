//! Dependency-ordered load/unload scheduling
//!
//! The scheduler drives the lifecycle engine in waves until the graph
//! reaches a stable configuration. A node becomes eligible once every one
//! of its still-pending upstreams has settled; invalid nodes are eligible
//! immediately, which is what keeps cycles from stalling the fixed point.
//! Eligible nodes split into loads and unloads, both dispatched to the
//! engine concurrently, and every outcome wakes the node's downstreams
//! for the next wave.

use crate::error::{ManagerError, ManagerResult};
use crate::graph::DependencyGraph;
use crate::lifecycle::{LifecycleEngine, ModelReadyState};
use crate::model::{ModelIdentifier, ModelInfoMap};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Terminal verdict for every node touched by one scheduling run
pub type LoadResults = BTreeMap<String, ManagerResult<()>>;

/// Drive loads and unloads for `affected` until no further progress is
/// possible. Mutates node `status` and `loaded_versions` to reflect the
/// outcomes and returns the per-model verdicts.
pub async fn load_by_dependency(
    graph: &mut DependencyGraph,
    infos: &ModelInfoMap,
    lifecycle: &dyn LifecycleEngine,
    affected: &BTreeSet<ModelIdentifier>,
    load_timeout: Duration,
) -> LoadResults {
    let mut results = LoadResults::new();
    // Outcome per settled node, consulted when its downstreams come up.
    let mut settled: HashMap<ModelIdentifier, ManagerResult<()>> = HashMap::new();
    let mut pending: BTreeSet<ModelIdentifier> = affected
        .iter()
        .filter(|id| graph.contains(id))
        .cloned()
        .collect();

    while !pending.is_empty() {
        let (to_load, to_unload) = partition_wave(graph, &pending, &settled);
        if to_load.is_empty() && to_unload.is_empty() {
            break;
        }

        let load_futures = to_load.iter().map(|id| {
            let id = id.clone();
            async {
                let outcome = dispatch_load(&id, infos, lifecycle, load_timeout).await;
                (id, outcome)
            }
        });
        let unload_futures = to_unload.iter().map(|id| {
            let id = id.clone();
            async {
                let outcome = dispatch_unload(&id, lifecycle, load_timeout).await;
                (id, outcome)
            }
        });
        let (load_outcomes, unload_outcomes) =
            futures::join!(join_all(load_futures), join_all(unload_futures));

        for (id, outcome) in load_outcomes {
            let verdict = match outcome {
                Ok(()) => {
                    let ready = ready_versions(lifecycle, &id);
                    if let Some(node) = graph.get_mut(&id) {
                        node.loaded_versions = ready.clone();
                    }
                    if ready.is_empty() {
                        Err(ManagerError::unavailable(format!(
                            "failed to load '{id}': no version is in READY state"
                        )))
                    } else {
                        Ok(())
                    }
                }
                Err(err) => {
                    tracing::error!(model = %id, error = %err, "Load failed");
                    if let Some(node) = graph.get_mut(&id) {
                        node.loaded_versions.clear();
                        node.status = Err(err.clone());
                    }
                    Err(err)
                }
            };
            results.insert(id.to_string(), verdict.clone());
            settled.insert(id.clone(), verdict);
            pending.remove(&id);
        }

        for (id, outcome) in unload_outcomes {
            if let Err(err) = outcome {
                tracing::warn!(model = %id, error = %err, "Unload reported an error");
            }
            let verdict = match graph.get_mut(&id) {
                Some(node) => {
                    node.loaded_versions.clear();
                    // An invalid node's verdict is its validation failure;
                    // a garbage-collected valid node unloads cleanly.
                    node.status.clone()
                }
                None => Ok(()),
            };
            results.insert(id.to_string(), verdict.clone());
            settled.insert(id.clone(), verdict);
            pending.remove(&id);
        }
    }

    results
}

/// Split the pending set into this wave's loads and unloads.
///
/// Nodes whose pending upstreams have not all settled are left for a
/// later wave. May rewrite a node's status when an upstream failed or no
/// longer serves the required versions.
fn partition_wave(
    graph: &mut DependencyGraph,
    pending: &BTreeSet<ModelIdentifier>,
    settled: &HashMap<ModelIdentifier, ManagerResult<()>>,
) -> (Vec<ModelIdentifier>, Vec<ModelIdentifier>) {
    let mut to_load = Vec::new();
    let mut to_unload = Vec::new();

    for id in pending {
        let Some(node) = graph.get(id) else {
            continue;
        };

        if !node.is_valid() {
            to_unload.push(id.clone());
            continue;
        }

        let waiting = node
            .upstreams
            .keys()
            .any(|u| pending.contains(u) && !settled.contains_key(u));
        if waiting {
            continue;
        }

        // Upstream settled with a failure this cycle: the dependent can
        // never come up, so fail it instead of blocking forever.
        let failed_upstream = node.upstreams.keys().find_map(|u| {
            settled
                .get(u)
                .and_then(|verdict| verdict.as_ref().err())
                .map(|err| (u.clone(), err.clone()))
        });
        if let Some((upstream, err)) = failed_upstream {
            if let Some(node) = graph.get_mut(id) {
                node.status = Err(ManagerError::invalid_argument(format!(
                    "dependency failed: {upstream}: {err}"
                )));
            }
            to_unload.push(id.clone());
            continue;
        }

        let unsatisfied = node.upstreams.iter().find_map(|(u, required)| {
            match graph.get(u) {
                Some(unode) if unode.serves(required) => None,
                _ => Some(u.clone()),
            }
        });
        if let Some(upstream) = unsatisfied {
            if let Some(node) = graph.get_mut(id) {
                node.status = Err(ManagerError::unavailable(format!(
                    "dependency unsatisfied: '{upstream}' does not serve the required versions"
                )));
            }
            to_unload.push(id.clone());
            continue;
        }

        // Nothing references the model and nobody asked for it directly.
        if !node.explicitly_load && node.downstreams.is_empty() {
            to_unload.push(id.clone());
            continue;
        }

        to_load.push(id.clone());
    }

    (to_load, to_unload)
}

async fn dispatch_load(
    id: &ModelIdentifier,
    infos: &ModelInfoMap,
    lifecycle: &dyn LifecycleEngine,
    load_timeout: Duration,
) -> ManagerResult<()> {
    let Some(info) = infos.get(id) else {
        return Err(ManagerError::internal(format!(
            "no model info available for '{id}'"
        )));
    };
    match tokio::time::timeout(load_timeout, lifecycle.async_load(id, info)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ManagerError::internal(format!(
            "load of '{id}' timed out after {}s",
            load_timeout.as_secs()
        ))),
    }
}

async fn dispatch_unload(
    id: &ModelIdentifier,
    lifecycle: &dyn LifecycleEngine,
    load_timeout: Duration,
) -> ManagerResult<()> {
    match tokio::time::timeout(load_timeout, lifecycle.async_unload(id)).await {
        // Unloading something the engine never served is not an error.
        Ok(Err(ManagerError::NotFound(_))) | Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ManagerError::internal(format!(
            "unload of '{id}' timed out after {}s",
            load_timeout.as_secs()
        ))),
    }
}

fn ready_versions(lifecycle: &dyn LifecycleEngine, id: &ModelIdentifier) -> BTreeSet<i64> {
    lifecycle
        .version_states(id)
        .into_iter()
        .filter(|(_, state)| state.state == ModelReadyState::Ready)
        .map(|(version, _)| version)
        .collect()
}
