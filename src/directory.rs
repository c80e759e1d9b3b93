//! The set of data clusters taking part in a run, with per-cluster recovery
//! flags.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::DataClusterApi;
use crate::types::ClusterName;

/// Canonical data cluster name for the `index`-th registered cluster.
pub fn cluster_name(index: usize) -> ClusterName {
    format!("cluster_{:08}", index)
}

pub struct DataCluster {
    pub handle: Arc<dyn DataClusterApi>,
    /// Restored from backup during this run.
    pub restored: bool,
    /// The restore that re-registered this cluster reported warnings.
    pub restore_has_messages: bool,
}

impl DataCluster {
    pub fn new(handle: Arc<dyn DataClusterApi>) -> Self {
        Self {
            handle,
            restored: false,
            restore_has_messages: false,
        }
    }
}

#[derive(Default)]
pub struct ClusterDirectory {
    clusters: BTreeMap<ClusterName, DataCluster>,
    index: Vec<ClusterName>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: Arc<dyn DataClusterApi>) {
        let name = handle.name().clone();
        if self.clusters.insert(name.clone(), DataCluster::new(handle)).is_none() {
            self.index.push(name);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Cluster names in registration order.
    pub fn names(&self) -> &[ClusterName] {
        &self.index
    }

    pub fn handle(&self, name: &ClusterName) -> Option<Arc<dyn DataClusterApi>> {
        self.clusters.get(name).map(|c| c.handle.clone())
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&ClusterName, &DataCluster)> {
        self.clusters.iter()
    }

    pub fn is_restored(&self, name: &ClusterName) -> bool {
        self.clusters.get(name).is_some_and(|c| c.restored)
    }

    pub fn restore_has_messages(&self, name: &ClusterName) -> bool {
        self.clusters.get(name).is_some_and(|c| c.restore_has_messages)
    }

    pub fn mark_restored(&mut self, name: &ClusterName, has_messages: bool) {
        if let Some(cluster) = self.clusters.get_mut(name) {
            cluster.restored = true;
            cluster.restore_has_messages = has_messages;
        }
    }
}
