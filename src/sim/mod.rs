//! Deterministic in-memory metacluster.
//!
//! Implements the collaborator traits from `crate::api` so the recovery
//! engine can run end to end in tests and from the binary:
//!
//! - `SimManagementCluster`: tenant directory, automatic cluster assignment
//!   and both restore modes
//! - `SimDataCluster`: per-cluster tenant directory, registration and keyspace
//! - `SimBackupAgent`: backups that capture a cluster's image at a random
//!   instant while they run
//!
//! Every operation sleeps a random simulated latency and then applies its
//! effect atomically, so operations interleave with backups the way real
//! transactions would. All randomness comes from one seeded generator; run
//! under a paused tokio clock on a current-thread runtime for reproducible
//! runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::{ApiError, ApiResult, DataClusterApi};
use crate::directory::cluster_name;
use crate::settings::SimConfig;

pub mod backup;
pub mod data_cluster;
pub mod management;

pub use backup::SimBackupAgent;
pub use data_cluster::{DataClusterImage, SimDataCluster};
pub use management::SimManagementCluster;

/// Shared randomness and timing for every simulated component.
pub struct SimEnv {
    rng: Mutex<StdRng>,
    op_latency_ms: (u64, u64),
    backup_duration_ms: (u64, u64),
    max_tenants_per_cluster: usize,
}

impl SimEnv {
    pub fn new(cfg: &SimConfig, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            op_latency_ms: cfg.op_latency_ms,
            backup_duration_ms: cfg.backup_duration_ms,
            max_tenants_per_cluster: cfg.max_tenants_per_cluster,
        })
    }

    fn sample_ms(&self, (min, max): (u64, u64)) -> u64 {
        self.rng().random_range(min..=max)
    }

    pub fn random_u64(&self) -> u64 {
        self.rng().random()
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep a random per-operation latency.
    pub async fn latency(&self) {
        let ms = self.sample_ms(self.op_latency_ms);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    /// Draw a backup's duration and the offset, within it, at which the
    /// backup captures its snapshot.
    pub fn backup_window(&self) -> (Duration, Duration) {
        let total = self.sample_ms(self.backup_duration_ms);
        let snapshot_after = if total == 0 {
            0
        } else {
            self.rng().random_range(0..total)
        };
        (
            Duration::from_millis(snapshot_after),
            Duration::from_millis(total),
        )
    }

    pub fn max_tenants_per_cluster(&self) -> usize {
        self.max_tenants_per_cluster
    }
}

/// Resolves connection strings to simulated data clusters.
#[derive(Default)]
pub struct SimNetwork {
    clusters: Mutex<BTreeMap<String, Arc<SimDataCluster>>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, cluster: Arc<SimDataCluster>) {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters.insert(cluster.connection_string(), cluster);
    }

    pub fn resolve(&self, connection_string: &str) -> ApiResult<Arc<SimDataCluster>> {
        let clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters
            .get(connection_string)
            .cloned()
            .ok_or(ApiError::ClusterNotFound)
    }
}

/// A complete simulated deployment: one management cluster, N data
/// clusters and a backup agent sharing one environment.
pub struct SimMetacluster {
    pub env: Arc<SimEnv>,
    pub network: Arc<SimNetwork>,
    pub management: Arc<SimManagementCluster>,
    pub data_clusters: Vec<Arc<SimDataCluster>>,
    pub backup_agent: Arc<SimBackupAgent>,
}

impl SimMetacluster {
    pub fn new(cfg: &SimConfig, seed: u64) -> Self {
        let env = SimEnv::new(cfg, seed);
        let network = SimNetwork::new();
        let data_clusters: Vec<_> = (0..cfg.data_clusters as usize)
            .map(|i| {
                let cluster = SimDataCluster::new(cluster_name(i), env.clone());
                network.add(cluster.clone());
                cluster
            })
            .collect();
        let management = SimManagementCluster::new(env.clone(), network.clone());
        let backup_agent = SimBackupAgent::new(env.clone(), network.clone());
        Self {
            env,
            network,
            management,
            data_clusters,
            backup_agent,
        }
    }

    pub fn data_cluster(&self, name: &str) -> Option<&Arc<SimDataCluster>> {
        self.data_clusters.iter().find(|c| c.name().as_str() == name)
    }
}
