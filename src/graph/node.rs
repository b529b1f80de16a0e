//! Dependency graph nodes

use crate::error::ManagerResult;
use crate::model::{ModelIdentifier, ModelInfo};
use crate::model_config::ModelConfig;
use std::collections::{BTreeSet, HashMap};

/// One node per model known to the repository manager.
///
/// Edges are identifier keys into the owning graph, never references;
/// `upstreams` and `downstreams` of connected nodes mirror each other.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    /// Canonical identifier, immutable for the node's lifetime
    pub id: ModelIdentifier,
    /// Last-parsed configuration
    pub config: ModelConfig,
    /// Copied from `ModelInfo`; protects the node from cascading removal
    pub explicitly_load: bool,
    /// Validation verdict; `Err` carries the invalid reason
    pub status: ManagerResult<()>,
    /// True iff `status` reflects the node's current upstream set
    pub checked: bool,
    /// Versions currently reported ready by the lifecycle engine
    pub loaded_versions: BTreeSet<i64>,
    /// Resolved upstream edges with the version set each one must serve;
    /// an empty set means any served version satisfies the dependency
    pub upstreams: HashMap<ModelIdentifier, BTreeSet<i64>>,
    /// Nodes whose configuration references this one
    pub downstreams: BTreeSet<ModelIdentifier>,
    /// Referenced names that did not resolve to any node
    pub missing_upstreams: BTreeSet<String>,
    /// Referenced names resolved across namespaces
    pub fuzzy_matched_upstreams: BTreeSet<String>,
}

impl DependencyNode {
    pub fn new(id: ModelIdentifier, info: &ModelInfo) -> Self {
        Self {
            id,
            config: info.config.clone(),
            explicitly_load: info.explicitly_load,
            status: Ok(()),
            checked: false,
            loaded_versions: BTreeSet::new(),
            upstreams: HashMap::new(),
            downstreams: BTreeSet::new(),
            missing_upstreams: BTreeSet::new(),
            fuzzy_matched_upstreams: BTreeSet::new(),
        }
    }

    /// Whether the last validation pass accepted this node
    pub fn is_valid(&self) -> bool {
        self.status.is_ok()
    }

    /// Whether `versions` are all served by this node right now.
    /// An empty requirement is satisfied by any non-empty served set.
    pub fn serves(&self, versions: &BTreeSet<i64>) -> bool {
        if versions.is_empty() {
            !self.loaded_versions.is_empty()
        } else {
            versions.is_subset(&self.loaded_versions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelInfo;
    use crate::model_config::ModelConfig;
    use std::path::PathBuf;

    fn node(loaded: &[i64]) -> DependencyNode {
        let info = ModelInfo::new(ModelConfig::autofill("m"), PathBuf::from("/tmp/m"), 0);
        let mut node = DependencyNode::new(ModelIdentifier::global("m"), &info);
        node.loaded_versions = loaded.iter().copied().collect();
        node
    }

    #[test]
    fn test_serves_any_version() {
        assert!(node(&[3]).serves(&BTreeSet::new()));
        assert!(!node(&[]).serves(&BTreeSet::new()));
    }

    #[test]
    fn test_serves_specific_versions() {
        let required = BTreeSet::from([1, 2]);
        assert!(node(&[1, 2, 3]).serves(&required));
        assert!(!node(&[1, 3]).serves(&required));
    }
}
