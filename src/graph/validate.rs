//! Connector: dependency resolution and validation
//!
//! For every affected node whose verdict is stale, the connector drops the
//! node's previous resolution state, re-resolves each declared dependency
//! (exact identifier first, then a unique cross-namespace fuzzy match),
//! installs reciprocal edges, and runs a cycle check. Fuzzy matches are
//! deliberately re-resolved on every pass: a newcomer carrying the same
//! name must invalidate a previously unique match.

use super::DependencyGraph;
use crate::error::ManagerError;
use crate::model::ModelIdentifier;
use std::collections::{BTreeSet, HashSet};

/// Re-validate every node of `affected` that is present and unchecked.
pub fn connect_affected(graph: &mut DependencyGraph, affected: &BTreeSet<ModelIdentifier>) {
    for id in affected {
        let needs_check = graph.get(id).is_some_and(|node| !node.checked);
        if needs_check {
            validate_node(graph, id);
        }
    }
}

fn validate_node(graph: &mut DependencyGraph, id: &ModelIdentifier) {
    // Start from a clean slate; stale edges and waiter registrations are
    // rebuilt below from the current configuration.
    graph.disconnect_upstream_edges(id);

    let dependencies = match graph.get_mut(id) {
        Some(node) => {
            node.status = Ok(());
            node.config.dependencies()
        }
        None => return,
    };

    // Leaf models are trivially valid.
    if dependencies.is_empty() {
        if let Some(node) = graph.get_mut(id) {
            node.checked = true;
        }
        return;
    }

    for (dep_name, required_versions) in dependencies {
        let wanted = ModelIdentifier::new(id.namespace.clone(), dep_name.clone());
        match graph.resolve(&wanted, true) {
            Some(upstream) => {
                let fuzzy = upstream != wanted;
                if let Some(node) = graph.get_mut(id) {
                    node.upstreams
                        .entry(upstream.clone())
                        .or_default()
                        .extend(required_versions);
                    if fuzzy {
                        node.fuzzy_matched_upstreams.insert(dep_name.clone());
                        tracing::debug!(
                            model = %id,
                            dependency = %dep_name,
                            resolved = %upstream,
                            "Dependency resolved across namespaces"
                        );
                    }
                }
                if let Some(unode) = graph.get_mut(&upstream) {
                    unode.downstreams.insert(id.clone());
                }
            }
            None => {
                graph.register_waiter(&dep_name, id);
                if let Some(node) = graph.get_mut(id) {
                    node.missing_upstreams.insert(dep_name.clone());
                    node.status = Err(ManagerError::invalid_argument(format!(
                        "dependency missing: {dep_name}"
                    )));
                }
            }
        }
    }

    let valid_so_far = graph.get(id).is_some_and(|node| node.status.is_ok());
    if valid_so_far && let Some(via) = find_cycle(graph, id) {
        // Edges stay installed so later repairs still propagate unchecks
        // through this node.
        if let Some(node) = graph.get_mut(id) {
            node.status = Err(ManagerError::invalid_argument(format!(
                "circular dependency: cycle through '{via}'"
            )));
        }
    }

    if let Some(node) = graph.get_mut(id) {
        node.checked = true;
    }
}

/// Walk the resolved upstream edges from `start`; if `start` is revisited,
/// return the direct upstream through which the cycle closes.
fn find_cycle(graph: &DependencyGraph, start: &ModelIdentifier) -> Option<ModelIdentifier> {
    let direct: Vec<ModelIdentifier> =
        graph.get(start)?.upstreams.keys().cloned().collect();

    for entry in direct {
        let mut stack = vec![entry.clone()];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == *start {
                return Some(entry);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = graph.get(&current) {
                stack.extend(node.upstreams.keys().cloned());
            }
        }
    }
    None
}
