//! The metacluster restore workload: shared context plus the setup, start
//! and check phases.
//!
//! Every phase takes a `&RecoveryContext`. The context owns the reference
//! model, the cluster directory and the seeded random source; the
//! collaborators it talks to are injected as trait objects.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::api::{ApiError, BackupAgent, DataClusterApi, ManagementApi};
use crate::capacity::CapacityPolicy;
use crate::checker::{self, ConsistencyViolation};
use crate::directory::ClusterDirectory;
use crate::generator;
use crate::model::ReferenceModel;
use crate::orchestrator::{self, RecoveryError, RecoveryMode};
use crate::settings::{AppConfig, WorkloadConfig};
use crate::sim::SimMetacluster;
use crate::types::{
    AccessTime, ClusterName, TENANT_ID_PREFIX_MAX, TENANT_ID_PREFIX_MIN, TenantId, TenantMapEntry,
};

pub const MANAGEMENT_CLUSTER_NAME: &str = "management_cluster";

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyViolation),
}

impl From<ApiError> for WorkloadError {
    fn from(e: ApiError) -> Self {
        WorkloadError::Recovery(RecoveryError::Api(e))
    }
}

/// Explicit state shared by the generator, orchestrator, resolver and
/// checker for one run.
pub struct RecoveryContext {
    pub management: Arc<dyn ManagementApi>,
    pub backup_agent: Arc<dyn BackupAgent>,
    pub config: WorkloadConfig,
    pub mode: RecoveryMode,
    max_tenants_per_cluster: usize,
    model: Mutex<ReferenceModel>,
    directory: Mutex<ClusterDirectory>,
    rng: Mutex<StdRng>,
    tenant_group_capacity: AtomicU32,
    backup_complete: AtomicBool,
    end_time: Mutex<Option<Instant>>,
    management_tenants_before_restore: Mutex<Vec<(TenantId, TenantMapEntry)>>,
}

impl RecoveryContext {
    /// Build a context over the given collaborators. The recovery mode is
    /// taken from the config when pinned there, otherwise drawn from `seed`.
    pub fn new(
        management: Arc<dyn ManagementApi>,
        backup_agent: Arc<dyn BackupAgent>,
        data_clusters: Vec<Arc<dyn DataClusterApi>>,
        config: WorkloadConfig,
        max_tenants_per_cluster: usize,
        seed: u64,
    ) -> Self {
        let config = config.normalized();
        let mut rng = StdRng::seed_from_u64(seed);
        let mode = match config.recovery_mode {
            Some(setting) => RecoveryMode::from(setting),
            None => RecoveryMode::choose(&mut rng),
        };

        let mut directory = ClusterDirectory::new();
        for cluster in data_clusters {
            directory.add(cluster);
        }
        let model = ReferenceModel::new(
            directory.names().iter(),
            config.max_tenants,
            config.max_tenant_groups,
        );
        let capacity = CapacityPolicy::initial_capacity(
            config.initial_tenants,
            config.max_tenant_groups,
            directory.len() as u32,
        );

        Self {
            management,
            backup_agent,
            config,
            mode,
            max_tenants_per_cluster,
            model: Mutex::new(model),
            directory: Mutex::new(directory),
            rng: Mutex::new(rng),
            tenant_group_capacity: AtomicU32::new(capacity),
            backup_complete: AtomicBool::new(false),
            end_time: Mutex::new(None),
            management_tenants_before_restore: Mutex::new(Vec::new()),
        }
    }

    pub fn model(&self) -> MutexGuard<'_, ReferenceModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn directory(&self) -> MutexGuard<'_, ClusterDirectory> {
        self.directory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with the model and the random source. Locks are always taken
    /// in this order.
    pub fn with_model_rng<T>(&self, f: impl FnOnce(&ReferenceModel, &mut StdRng) -> T) -> T {
        let model = self.model();
        let mut rng = self.rng();
        f(&model, &mut rng)
    }

    pub fn coinflip(&self) -> bool {
        self.rng().random_bool(0.5)
    }

    pub fn recover_management(&self) -> bool {
        self.mode.recover_management()
    }

    pub fn recover_data(&self) -> bool {
        self.mode.recover_data()
    }

    /// Directory reads request one entry more than this so an oversized
    /// result can be detected.
    pub fn max_tenants_per_cluster(&self) -> usize {
        self.max_tenants_per_cluster
    }

    pub fn tenant_group_capacity(&self) -> u32 {
        self.tenant_group_capacity.load(Ordering::SeqCst)
    }

    /// Raise the capacity knob. Returns the value now in effect, which is
    /// never lower than before.
    pub fn raise_tenant_group_capacity(&self, capacity: u32) -> u32 {
        let previous = self.tenant_group_capacity.fetch_max(capacity, Ordering::SeqCst);
        previous.max(capacity)
    }

    /// Access-time marker for an operation starting now.
    pub fn access_time(&self) -> AccessTime {
        if self.backup_complete.load(Ordering::SeqCst) {
            AccessTime::AfterBackup
        } else {
            AccessTime::DuringBackup
        }
    }

    /// Flip to the after-backup regime and let operations continue for
    /// `grace` more.
    pub fn finish_backups(&self, grace: Duration) {
        self.backup_complete.store(true, Ordering::SeqCst);
        *self.end_time.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + grace);
    }

    pub fn deadline_passed(&self) -> bool {
        let end_time = *self.end_time.lock().unwrap_or_else(|e| e.into_inner());
        end_time.is_some_and(|end| Instant::now() >= end)
    }

    pub fn set_management_tenants_before_restore(&self, tenants: Vec<(TenantId, TenantMapEntry)>) {
        *self
            .management_tenants_before_restore
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = tenants;
    }

    pub fn management_tenants_before_restore(&self) -> Vec<(TenantId, TenantMapEntry)> {
        self.management_tenants_before_restore
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cluster_handle(&self, name: &ClusterName) -> Result<Arc<dyn DataClusterApi>, ApiError> {
        self.directory().handle(name).ok_or(ApiError::ClusterNotFound)
    }
}

/// Create the metacluster, register every data cluster and create the
/// initial tenants.
pub async fn setup(ctx: &RecoveryContext) -> Result<(), WorkloadError> {
    let prefix = ctx
        .rng()
        .random_range(TENANT_ID_PREFIX_MIN..=TENANT_ID_PREFIX_MAX);
    ctx.management
        .create_metacluster(MANAGEMENT_CLUSTER_NAME, prefix)
        .await?;

    let clusters: Vec<Arc<dyn DataClusterApi>> = {
        let directory = ctx.directory();
        directory
            .names()
            .iter()
            .filter_map(|name| directory.handle(name))
            .collect()
    };
    let capacity = ctx.tenant_group_capacity();
    for cluster in clusters {
        ctx.management
            .register_cluster(cluster.name(), &cluster.connection_string(), capacity)
            .await?;
        debug!(cluster = %cluster.name(), capacity, "registered data cluster");
    }

    info!(tenants = ctx.config.initial_tenants, "creating initial tenants");
    while ctx.model().tenant_count() < ctx.config.initial_tenants as usize {
        generator::create_tenant(ctx, AccessTime::BeforeBackup).await?;
    }
    info!(tenants = ctx.model().tenant_count(), "initial tenants created");
    Ok(())
}

/// Run operations concurrently with backups, then recover.
pub async fn start(ctx: &RecoveryContext) -> Result<(), WorkloadError> {
    orchestrator::run(ctx).await?;
    Ok(())
}

/// Verify the recovered metacluster.
pub async fn check(ctx: &RecoveryContext) -> Result<(), WorkloadError> {
    checker::check(ctx).await?;
    Ok(())
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub seed: u64,
    pub mode: RecoveryMode,
    pub restored_clusters: Vec<ClusterName>,
    pub live_tenants: usize,
    pub deleted_tenants: usize,
}

impl RecoveryContext {
    pub fn report(&self, seed: u64) -> RunReport {
        let restored_clusters = self
            .directory()
            .iter()
            .filter(|(_, c)| c.restored)
            .map(|(name, _)| name.clone())
            .collect();
        let model = self.model();
        RunReport {
            seed,
            mode: self.mode,
            restored_clusters,
            live_tenants: model.tenant_count(),
            deleted_tenants: model.deleted_tenants().len(),
        }
    }
}

/// Run the whole workload against a fresh simulated metacluster.
pub async fn run_simulation(config: &AppConfig, seed: u64) -> Result<RunReport, WorkloadError> {
    let sim = SimMetacluster::new(&config.sim, seed.wrapping_add(1));
    let data_clusters = sim
        .data_clusters
        .iter()
        .map(|c| c.clone() as Arc<dyn DataClusterApi>)
        .collect();
    let ctx = RecoveryContext::new(
        sim.management.clone(),
        sim.backup_agent.clone(),
        data_clusters,
        config.workload.clone(),
        config.sim.max_tenants_per_cluster,
        seed,
    );
    info!(seed, mode = ?ctx.mode, "starting metacluster restore workload");

    setup(&ctx).await?;
    start(&ctx).await?;
    check(&ctx).await?;

    let report = ctx.report(seed);
    info!(
        seed,
        mode = ?report.mode,
        restored = ?report.restored_clusters,
        live_tenants = report.live_tenants,
        deleted_tenants = report.deleted_tenants,
        "metacluster restore workload passed"
    );
    Ok(report)
}
