//! Mutable dependency graph over known models
//!
//! The graph exclusively owns every node; edges are identifier keys, kept
//! reciprocal at all times (`n.upstreams` mirrors `u.downstreams`). Three
//! indices back it: `nodes` (owning), `by_name` (all namespaces carrying a
//! name, for fuzzy matching) and `waiters` (nodes waiting for a name to
//! appear). All mutators run under the manager's writer lock.

mod node;
mod validate;

pub use node::DependencyNode;
pub use validate::connect_affected;

use crate::model::{ModelIdentifier, ModelInfoMap};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<ModelIdentifier, DependencyNode>,
    /// name -> every identifier carrying that name
    by_name: HashMap<String, BTreeSet<ModelIdentifier>>,
    /// name -> nodes whose config references the name but found no node
    waiters: HashMap<String, BTreeSet<ModelIdentifier>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ModelIdentifier) -> Option<&DependencyNode> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ModelIdentifier) -> Option<&mut DependencyNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &ModelIdentifier) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    /// Every identifier carrying `name`, across namespaces
    pub fn ids_with_name(&self, name: &str) -> BTreeSet<ModelIdentifier> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    /// Nodes registered as waiting for `name` to appear
    pub fn waiters_of(&self, name: &str) -> BTreeSet<ModelIdentifier> {
        self.waiters.get(name).cloned().unwrap_or_default()
    }

    /// Exact lookup; with `allow_fuzzy`, fall back to the single node of
    /// that name in any namespace, if there is exactly one.
    pub fn find_node(&self, id: &ModelIdentifier, allow_fuzzy: bool) -> Option<&DependencyNode> {
        self.resolve(id, allow_fuzzy).and_then(|id| self.nodes.get(&id))
    }

    /// Like `find_node` but yields the resolved identifier
    pub fn resolve(&self, id: &ModelIdentifier, allow_fuzzy: bool) -> Option<ModelIdentifier> {
        if self.nodes.contains_key(id) {
            return Some(id.clone());
        }
        if allow_fuzzy
            && let Some(ids) = self.by_name.get(&id.name)
            && ids.len() == 1
        {
            return ids.first().cloned();
        }
        None
    }

    /// Add freshly discovered models to the graph.
    ///
    /// Returns the nodes to re-evaluate: the added nodes themselves plus
    /// every node that was waiting for one of the added names (those are
    /// unchecked together with their transitive downstreams).
    pub fn add_nodes(
        &mut self,
        ids: &BTreeSet<ModelIdentifier>,
        infos: &ModelInfoMap,
    ) -> BTreeSet<ModelIdentifier> {
        let mut affected = BTreeSet::new();
        for id in ids {
            let Some(info) = infos.get(id) else {
                continue;
            };
            self.nodes.insert(id.clone(), DependencyNode::new(id.clone(), info));
            self.by_name.entry(id.name.clone()).or_default().insert(id.clone());
            affected.insert(id.clone());

            if let Some(waiting) = self.waiters.get(&id.name).cloned() {
                for waiter in waiting {
                    if self.nodes.contains_key(&waiter) {
                        affected.extend(self.uncheck_downstream([waiter.clone()]));
                        affected.insert(waiter);
                    }
                }
            }

            // A second namesake makes any fuzzy resolution of this name
            // ambiguous: revisit every node that matched it across
            // namespaces.
            let namesakes = self.ids_with_name(&id.name);
            if namesakes.len() > 1 {
                for other in namesakes {
                    if other == *id {
                        continue;
                    }
                    for dependent in self.fuzzy_dependents(&other, &id.name) {
                        affected.extend(self.uncheck_downstream([dependent.clone()]));
                        affected.insert(dependent);
                    }
                }
            }
        }
        affected
    }

    /// Downstreams of `of` that resolved `name` by fuzzy match
    fn fuzzy_dependents(&self, of: &ModelIdentifier, name: &str) -> Vec<ModelIdentifier> {
        let Some(node) = self.nodes.get(of) else {
            return Vec::new();
        };
        node.downstreams
            .iter()
            .filter(|d| {
                self.nodes
                    .get(d)
                    .is_some_and(|dnode| dnode.fuzzy_matched_upstreams.contains(name))
            })
            .cloned()
            .collect()
    }

    /// Refresh nodes whose on-disk state changed.
    ///
    /// Every current upstream connection is dropped (the new configuration
    /// may declare different dependencies) and the node plus its transitive
    /// downstreams are unchecked for re-validation.
    pub fn update_nodes(
        &mut self,
        ids: &BTreeSet<ModelIdentifier>,
        infos: &ModelInfoMap,
    ) -> BTreeSet<ModelIdentifier> {
        let mut affected = BTreeSet::new();
        for id in ids {
            let Some(info) = infos.get(id) else {
                continue;
            };
            let Some(existing) = self.nodes.get(id) else {
                continue;
            };

            let downstreams = existing.downstreams.clone();
            affected.extend(self.uncheck_downstream(downstreams));
            self.disconnect_upstream_edges(id);

            if let Some(node) = self.nodes.get_mut(id) {
                node.config = info.config.clone();
                node.explicitly_load = info.explicitly_load;
                node.checked = false;
                node.status = Ok(());
                affected.insert(id.clone());
            }
        }
        affected
    }

    /// Remove nodes, optionally cascading to upstreams left without
    /// downstreams.
    ///
    /// Returns `(affected, removed)`: nodes to re-evaluate because they
    /// depended on something removed, and everything actually removed.
    /// Cascading pulls in former upstreams that are no longer referenced
    /// and were not explicitly loaded, wave by wave until a fixed point.
    pub fn remove_nodes(
        &mut self,
        ids: &BTreeSet<ModelIdentifier>,
        cascading: bool,
    ) -> (BTreeSet<ModelIdentifier>, BTreeSet<ModelIdentifier>) {
        let mut all_affected = BTreeSet::new();
        let mut all_removed = BTreeSet::new();
        let mut current = ids.clone();

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for id in &current {
                let (upstreams, downstreams, unchecked) = self.remove_node(id);
                all_affected.extend(unchecked);

                // If exactly one namesake is left, the name can be fuzzy
                // matched again: give its waiters another chance.
                if self.ids_with_name(&id.name).len() == 1 {
                    for waiter in self.waiters_of(&id.name) {
                        if self.nodes.contains_key(&waiter) {
                            all_affected.extend(self.uncheck_downstream([waiter.clone()]));
                            all_affected.insert(waiter);
                        }
                    }
                }

                if cascading {
                    for upstream in upstreams {
                        if let Some(unode) = self.nodes.get(&upstream)
                            && unode.downstreams.is_empty()
                            && !unode.explicitly_load
                        {
                            next.insert(upstream);
                        }
                    }
                }

                // Downstreams must be re-evaluated once the removal is in
                // place; the removed node itself never is.
                all_affected.extend(downstreams);
                all_removed.insert(id.clone());
                all_affected.remove(id);
            }
            current = next;
        }

        for id in &all_removed {
            all_affected.remove(id);
        }
        (all_affected, all_removed)
    }

    /// Remove one node and every edge incident to it.
    ///
    /// Returns the identifiers of its former upstreams and downstreams,
    /// plus every node unchecked by the downstream walk.
    fn remove_node(
        &mut self,
        id: &ModelIdentifier,
    ) -> (
        BTreeSet<ModelIdentifier>,
        BTreeSet<ModelIdentifier>,
        BTreeSet<ModelIdentifier>,
    ) {
        let Some(node) = self.nodes.remove(id) else {
            return (BTreeSet::new(), BTreeSet::new(), BTreeSet::new());
        };

        let upstreams: BTreeSet<_> = node.upstreams.keys().cloned().collect();
        for upstream in &upstreams {
            if let Some(unode) = self.nodes.get_mut(upstream) {
                unode.downstreams.remove(id);
            }
        }

        let unchecked = self.uncheck_downstream(node.downstreams.iter().cloned());
        for downstream in &node.downstreams {
            if let Some(dnode) = self.nodes.get_mut(downstream) {
                dnode.upstreams.remove(id);
            }
        }

        for name in &node.missing_upstreams {
            self.drop_waiter(name, id);
        }
        if let Some(ids) = self.by_name.get_mut(&id.name) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_name.remove(&id.name);
            }
        }

        tracing::debug!(model = %id, "Node removed from dependency graph");
        (upstreams, node.downstreams, unchecked)
    }

    /// Uncheck the given nodes and their transitive downstreams so the
    /// next validation pass revisits them, returning everything that was
    /// unchecked. Already-unchecked nodes stop the walk; the traversal
    /// uses an explicit stack.
    pub fn uncheck_downstream(
        &mut self,
        seeds: impl IntoIterator<Item = ModelIdentifier>,
    ) -> BTreeSet<ModelIdentifier> {
        let mut unchecked = BTreeSet::new();
        let mut stack: Vec<ModelIdentifier> = seeds.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if !node.checked {
                continue;
            }
            node.checked = false;
            node.status = Ok(());
            stack.extend(node.downstreams.iter().cloned());
            unchecked.insert(id);
        }
        unchecked
    }

    /// Drop `id`'s upstream edges, waiter registrations, and resolution
    /// bookkeeping so its dependencies can be resolved afresh.
    pub(crate) fn disconnect_upstream_edges(&mut self, id: &ModelIdentifier) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let upstreams: Vec<_> = node.upstreams.drain().map(|(u, _)| u).collect();
        let missing: Vec<_> = std::mem::take(&mut node.missing_upstreams).into_iter().collect();
        node.fuzzy_matched_upstreams.clear();

        for upstream in upstreams {
            if let Some(unode) = self.nodes.get_mut(&upstream) {
                unode.downstreams.remove(id);
            }
        }
        for name in missing {
            self.drop_waiter(&name, id);
        }
    }

    pub(crate) fn register_waiter(&mut self, name: &str, id: &ModelIdentifier) {
        self.waiters.entry(name.to_string()).or_default().insert(id.clone());
    }

    fn drop_waiter(&mut self, name: &str, id: &ModelIdentifier) {
        if let Some(waiting) = self.waiters.get_mut(name) {
            waiting.remove(id);
            if waiting.is_empty() {
                self.waiters.remove(name);
            }
        }
    }
}
