//! Drives one recovery: back up a random subset of data clusters while
//! operations run, then restore those clusters and/or rebuild the
//! management cluster from the data clusters.

use futures::future::try_join_all;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::api::{
    ApiError, BackupTag, DataClusterApi, ErrorClass, RestoreFailure, RestoreOptions,
};
use crate::generator;
use crate::keys::default_backup_ranges;
use crate::resolver::{self, bounded};
use crate::settings::RecoveryModeSetting;
use crate::types::{ClusterName, DataTenantEntry, TENANT_ID_PREFIX_MAX, TENANT_ID_PREFIX_MIN, TenantId};
use crate::workload::{MANAGEMENT_CLUSTER_NAME, RecoveryContext};

/// Which side(s) of the metacluster a run recovers. Never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    ManagementOnly,
    DataOnly,
    Both,
}

impl RecoveryMode {
    pub const ALL: [RecoveryMode; 3] = [
        RecoveryMode::ManagementOnly,
        RecoveryMode::DataOnly,
        RecoveryMode::Both,
    ];

    pub fn choose<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }

    pub fn recover_management(self) -> bool {
        self != RecoveryMode::DataOnly
    }

    pub fn recover_data(self) -> bool {
        self != RecoveryMode::ManagementOnly
    }
}

impl From<RecoveryModeSetting> for RecoveryMode {
    fn from(setting: RecoveryModeSetting) -> Self {
        match setting {
            RecoveryModeSetting::Management => RecoveryMode::ManagementOnly,
            RecoveryModeSetting::Data => RecoveryMode::DataOnly,
            RecoveryModeSetting::Both => RecoveryMode::Both,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("restoring {cluster} failed with `{error}' but no matching collisions were known")]
    UnexpectedCollision { cluster: ClusterName, error: ApiError },
    #[error("rebuilding the management cluster changed the tenants of data cluster {0}")]
    DataClusterMutated(ClusterName),
    #[error("restoring {0} failed without reporting any messages")]
    RestoreWithoutMessages(ClusterName),
    #[error("restoring {0} succeeded although collisions were outstanding")]
    ManagementCollisionsRemain(ClusterName),
}

impl From<RestoreFailure> for RecoveryError {
    fn from(failure: RestoreFailure) -> Self {
        RecoveryError::Api(failure.error)
    }
}

/// Pick the clusters to back up: each with the configured probability, and
/// at least one. Empty unless data clusters are being recovered.
pub fn select_clusters(ctx: &RecoveryContext) -> Vec<ClusterName> {
    if !ctx.recover_data() {
        return Vec::new();
    }
    let names = ctx.directory().names().to_vec();
    let mut rng = ctx.rng();
    let mut selected: Vec<ClusterName> = names
        .iter()
        .filter(|_| rng.random_bool(ctx.config.backup_probability))
        .cloned()
        .collect();
    if selected.is_empty() {
        selected.extend(names.choose(&mut *rng).cloned());
    }
    for cluster in &selected {
        info!(cluster = %cluster, "chose cluster for restore");
    }
    selected
}

pub fn backup_container(cluster: &ClusterName) -> String {
    format!("file://simfdb/backups/{cluster}")
}

/// Back up a data cluster and wait for the backup to finish.
pub async fn backup_cluster(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
) -> Result<String, RecoveryError> {
    let handle = ctx.cluster_handle(cluster)?;
    let tag = BackupTag(cluster.clone());
    let ranges = default_backup_ranges();

    info!(cluster = %cluster, "submitting backup");
    match ctx
        .backup_agent
        .submit_backup(&handle, &backup_container(cluster), &tag, &ranges)
        .await
    {
        Ok(()) => {}
        Err(e) if e.class() == ErrorClass::BackupNoop => {
            debug!(cluster = %cluster, error = %e, "backup already in place");
        }
        Err(e) => return Err(e.into()),
    }

    info!(cluster = %cluster, "waiting for backup");
    let url = ctx.backup_agent.wait_backup(&handle, &tag).await?;
    info!(cluster = %cluster, url = %url, "backup complete");
    Ok(url)
}

/// Clear a data cluster and restore it from its backup. When
/// `add_to_metacluster` is set the restored cluster is re-registered with
/// the management cluster's view applied, optionally after a dry run.
pub async fn restore_data_cluster(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
    backup_url: &str,
    add_to_metacluster: bool,
    force_join: bool,
) -> Result<(), RecoveryError> {
    let handle = ctx.cluster_handle(cluster)?;
    let ranges = default_backup_ranges();

    info!(cluster = %cluster, "clearing data cluster");
    handle.clear_ranges(&ranges).await?;

    info!(cluster = %cluster, "restoring data cluster");
    ctx.backup_agent
        .restore(&handle, &BackupTag(cluster.clone()), backup_url, &ranges)
        .await?;

    let mut messages = Vec::new();
    if add_to_metacluster {
        info!(cluster = %cluster, "adding cluster to metacluster");
        let connection_string = handle.connection_string();
        if ctx.coinflip() {
            info!(cluster = %cluster, "adding cluster to metacluster (dry run)");
            let dry_run = RestoreOptions {
                apply_management_updates: true,
                dry_run: true,
                force_join,
            };
            ctx.management
                .restore_cluster(cluster, &connection_string, dry_run)
                .await?;
        }

        let options = RestoreOptions {
            apply_management_updates: true,
            dry_run: false,
            force_join,
        };
        messages = ctx
            .management
            .restore_cluster(cluster, &connection_string, options)
            .await?;
        info!(cluster = %cluster, messages = messages.len(), "restore complete");
        for message in &messages {
            debug!(cluster = %cluster, %message, "restore message");
        }
    }

    ctx.directory().mark_restored(cluster, !messages.is_empty());
    Ok(())
}

/// Read a data cluster's tenant map, bounded by the per-cluster limit.
pub async fn data_cluster_tenants(
    ctx: &RecoveryContext,
    handle: &Arc<dyn DataClusterApi>,
) -> Result<Vec<(TenantId, DataTenantEntry)>, RecoveryError> {
    let limit = ctx.max_tenants_per_cluster();
    Ok(bounded(handle.list_tenants(limit + 1).await?, limit)?)
}

/// Erase the management cluster's whole keyspace, registration included.
pub async fn reset_management_cluster(ctx: &RecoveryContext) -> Result<(), RecoveryError> {
    info!("erasing management cluster");
    ctx.management.erase().await?;
    info!("management cluster erased");
    Ok(())
}

async fn attempt_rebuild(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
    connection_string: &str,
    collisions: usize,
) -> Result<Vec<String>, RestoreFailure> {
    info!(cluster = %cluster, collisions, "restoring management cluster from data cluster");
    if ctx.coinflip() {
        info!(cluster = %cluster, collisions, "restoring management cluster from data cluster (dry run)");
        let dry_run = RestoreOptions {
            apply_management_updates: false,
            dry_run: true,
            force_join: ctx.coinflip(),
        };
        ctx.management
            .restore_cluster(cluster, connection_string, dry_run)
            .await?;
    }
    let options = RestoreOptions {
        apply_management_updates: false,
        dry_run: false,
        force_join: ctx.coinflip(),
    };
    ctx.management
        .restore_cluster(cluster, connection_string, options)
        .await
}

/// Re-register one data cluster with a freshly created management cluster,
/// resolving collisions until the restore goes through.
async fn rebuild_from_data_cluster(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
) -> Result<(), RecoveryError> {
    info!(cluster = %cluster, "processing data cluster");
    let handle = ctx.cluster_handle(cluster)?;
    handle.forget_metacluster().await?;
    info!(cluster = %cluster, "data cluster forgot its metacluster");

    let connection_string = handle.connection_string();
    let mut collisions = resolver::get_collisions(ctx, &handle).await?;
    loop {
        let before = data_cluster_tenants(ctx, &handle).await?;

        let attempt =
            attempt_rebuild(ctx, cluster, &connection_string, collisions.tenants.len()).await;
        let completed = match attempt {
            Ok(_) => {
                if !collisions.is_empty() {
                    return Err(RecoveryError::ManagementCollisionsRemain(cluster.clone()));
                }
                true
            }
            Err(failure) => {
                if !collisions.explains(&failure.error) {
                    return Err(match failure.error.class() {
                        ErrorClass::Collision => RecoveryError::UnexpectedCollision {
                            cluster: cluster.clone(),
                            error: failure.error,
                        },
                        _ => RecoveryError::Api(failure.error),
                    });
                }
                match ctx.management.remove_cluster(cluster).await {
                    Ok(()) => info!(cluster = %cluster, "removed partially restored cluster"),
                    Err(e) if e.class() == ErrorClass::MissingCluster => {}
                    Err(e) => return Err(e.into()),
                }
                if failure.messages.is_empty() {
                    return Err(RecoveryError::RestoreWithoutMessages(cluster.clone()));
                }
                for message in &failure.messages {
                    debug!(cluster = %cluster, %message, "restore collision");
                }
                false
            }
        };

        let after = data_cluster_tenants(ctx, &handle).await?;
        if before != after {
            return Err(RecoveryError::DataClusterMutated(cluster.clone()));
        }
        if completed {
            break;
        }

        resolver::resolve_collisions(ctx, cluster, &handle, &collisions).await?;
        collisions.clear();
    }
    info!(cluster = %cluster, "restored data cluster into management cluster");
    Ok(())
}

/// Recreate the metacluster on the erased management cluster and
/// re-register every data cluster from its own contents.
pub async fn restore_management_cluster(ctx: &RecoveryContext) -> Result<(), RecoveryError> {
    info!("restoring management cluster");
    let prefix = ctx
        .rng()
        .random_range(TENANT_ID_PREFIX_MIN..=TENANT_ID_PREFIX_MAX);
    ctx.management
        .create_metacluster(MANAGEMENT_CLUSTER_NAME, prefix)
        .await?;

    let clusters: Vec<ClusterName> = ctx.directory().iter().map(|(name, _)| name.clone()).collect();
    for cluster in &clusters {
        rebuild_from_data_cluster(ctx, cluster).await?;
    }
    info!("restored management cluster");
    Ok(())
}

async fn restore_all(
    ctx: &RecoveryContext,
    backups: &BTreeMap<ClusterName, String>,
    add_to_metacluster: bool,
    force_join: Option<bool>,
) -> Result<(), RecoveryError> {
    let restores = backups.iter().map(|(cluster, url)| {
        let force_join = force_join.unwrap_or_else(|| ctx.coinflip());
        restore_data_cluster(ctx, cluster, url, add_to_metacluster, force_join)
    });
    try_join_all(restores).await?;
    Ok(())
}

/// Run the recovery scenario for `ctx.mode`.
pub async fn run(ctx: &RecoveryContext) -> Result<(), RecoveryError> {
    info!(
        recover_management = ctx.recover_management(),
        recover_data = ctx.recover_data(),
        "starting recovery"
    );
    let selected = select_clusters(ctx);
    let grace = Duration::from_secs_f64(ctx.config.post_backup_ops_secs);

    let backups = async {
        let result = try_join_all(selected.iter().map(|cluster| async move {
            let url = backup_cluster(ctx, cluster).await?;
            Ok::<_, RecoveryError>((cluster.clone(), url))
        }))
        .await;
        ctx.finish_backups(grace);
        result
    };
    let (operations, backups) = tokio::join!(generator::run_operations(ctx), backups);
    let backups: BTreeMap<ClusterName, String> = backups?.into_iter().collect();
    operations?;
    info!("operations complete");

    if ctx.recover_management() {
        reset_management_cluster(ctx).await?;
    } else {
        let limit = ctx.max_tenants_per_cluster();
        let tenants = bounded(ctx.management.list_tenants(limit + 1).await?, limit)?;
        ctx.set_management_tenants_before_restore(tenants);
    }

    restore_all(ctx, &backups, !ctx.recover_management(), None).await?;

    if ctx.recover_management() {
        restore_management_cluster(ctx).await?;

        if !backups.is_empty() && ctx.coinflip() {
            info!("restoring data clusters a second time");
            restore_all(ctx, &backups, true, Some(true)).await?;
        }
    }
    Ok(())
}
