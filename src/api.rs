//! Capabilities the recovery engine consumes from its collaborators.
//!
//! - `ManagementApi`: the management cluster's tenant directory and
//!   metacluster administration (create/register/remove/restore).
//! - `DataClusterApi`: a data cluster's own tenant directory and registration.
//! - `BackupAgent`: backup and restore of a data cluster's keyspace.
//!
//! The engine never depends on how these are implemented; `crate::sim`
//! provides an in-memory implementation.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::keys::KeyRange;
use crate::types::{
    ClusterName, DataClusterEntry, DataTenantEntry, MetaclusterRegistration, TenantGroupEntry,
    TenantGroupName, TenantId, TenantMapEntry, TenantName,
};

/// Error kinds reported by the collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("tenant already exists")]
    TenantAlreadyExists,
    #[error("invalid tenant configuration")]
    InvalidTenantConfiguration,
    #[error("metacluster has no capacity for new tenant groups")]
    MetaclusterNoCapacity,
    #[error("cluster has no capacity for new tenant groups")]
    ClusterNoCapacity,
    #[error("cluster not found")]
    ClusterNotFound,
    #[error("tenant not found")]
    TenantNotFound,
    #[error("cluster already exists")]
    ClusterAlreadyExists,
    #[error("cluster already registered to a metacluster")]
    ClusterAlreadyRegistered,
    #[error("metacluster not found")]
    MetaclusterNotFound,
    #[error("backup unneeded")]
    BackupUnneeded,
    #[error("backup duplicate")]
    BackupDuplicate,
    #[error("backup not found: {0}")]
    BackupNotFound(String),
    #[error("too many tenants: read {0} entries")]
    TooManyTenants(usize),
    #[error("invalid metacluster operation: {0}")]
    InvalidMetaclusterOperation(String),
    #[error("permission denied")]
    PermissionDenied,
}

/// How the engine reacts to an `ApiError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Grow capacity and retry the same logical operation.
    Capacity,
    /// Resolve collisions and retry (only while known collisions exist).
    Collision,
    /// Backup submission was a no-op; swallow.
    BackupNoop,
    /// Cleanup found nothing to remove; swallow.
    MissingCluster,
    /// Anything else aborts the run.
    Fatal,
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::MetaclusterNoCapacity | ApiError::ClusterNoCapacity => ErrorClass::Capacity,
            ApiError::TenantAlreadyExists | ApiError::InvalidTenantConfiguration => {
                ErrorClass::Collision
            }
            ApiError::BackupUnneeded | ApiError::BackupDuplicate => ErrorClass::BackupNoop,
            ApiError::ClusterNotFound => ErrorClass::MissingCluster,
            _ => ErrorClass::Fatal,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Options for `ManagementApi::restore_cluster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    /// `true`: the management directory is authoritative and is pushed to a
    /// data cluster restored from backup. `false`: the management directory
    /// is being rebuilt from the data cluster's contents.
    pub apply_management_updates: bool,
    /// Report what would happen without committing anything.
    pub dry_run: bool,
    /// Accept a data cluster that is registered to a different metacluster
    /// incarnation.
    pub force_join: bool,
}

/// Outcome of a restore attempt that did not commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub error: ApiError,
    /// Messages gathered before the attempt failed (one per collision).
    pub messages: Vec<String>,
}

impl From<ApiError> for RestoreFailure {
    fn from(error: ApiError) -> Self {
        RestoreFailure {
            error,
            messages: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Create the metacluster registration on an empty management cluster.
    async fn create_metacluster(&self, name: &str, tenant_id_prefix: i64) -> ApiResult<()>;

    /// Erase the management cluster's entire keyspace including its
    /// registration.
    async fn erase(&self) -> ApiResult<()>;

    async fn register_cluster(
        &self,
        name: &ClusterName,
        connection_string: &str,
        capacity: u32,
    ) -> ApiResult<()>;

    /// Forcefully drop a data cluster registration and its tenants from the
    /// management directory.
    async fn remove_cluster(&self, name: &ClusterName) -> ApiResult<()>;

    async fn get_cluster(&self, name: &ClusterName) -> ApiResult<DataClusterEntry>;

    /// Set every named cluster's group capacity in one transaction.
    async fn update_cluster_capacities(&self, names: &[ClusterName], capacity: u32)
        -> ApiResult<()>;

    /// Register-by-rediscovery. On success returns warning messages.
    async fn restore_cluster(
        &self,
        name: &ClusterName,
        connection_string: &str,
        options: RestoreOptions,
    ) -> Result<Vec<String>, RestoreFailure>;

    /// Create a tenant, assigning it to a cluster automatically.
    async fn create_tenant(
        &self,
        name: &TenantName,
        tenant_group: Option<&TenantGroupName>,
    ) -> ApiResult<()>;

    async fn get_tenant(&self, name: &TenantName) -> ApiResult<TenantMapEntry>;

    async fn delete_tenant(&self, name: &TenantName) -> ApiResult<()>;

    async fn delete_tenant_by_id(&self, id: TenantId) -> ApiResult<()>;

    async fn configure_tenant_group(
        &self,
        name: &TenantName,
        tenant_group: Option<&TenantGroupName>,
    ) -> ApiResult<()>;

    async fn rename_tenant(&self, old: &TenantName, new: &TenantName) -> ApiResult<()>;

    /// Range-read the tenant map ordered by id, returning at most `limit`
    /// entries.
    async fn list_tenants(&self, limit: usize) -> ApiResult<Vec<(TenantId, TenantMapEntry)>>;

    async fn tenant_name_index(&self, limit: usize) -> ApiResult<Vec<(TenantName, TenantId)>>;

    async fn tenant_groups(&self, limit: usize)
        -> ApiResult<Vec<(TenantGroupName, TenantGroupEntry)>>;

    async fn tenants_in_group(
        &self,
        group: &TenantGroupName,
        limit: usize,
    ) -> ApiResult<BTreeSet<TenantId>>;

    async fn registration(&self) -> ApiResult<Option<MetaclusterRegistration>>;
}

#[async_trait]
pub trait DataClusterApi: Send + Sync {
    fn name(&self) -> &ClusterName;

    fn connection_string(&self) -> String;

    /// Range-read the tenant map ordered by id.
    async fn list_tenants(&self, limit: usize) -> ApiResult<Vec<(TenantId, DataTenantEntry)>>;

    async fn tenant_name_index(&self, limit: usize) -> ApiResult<Vec<(TenantName, TenantId)>>;

    async fn tenant_groups(&self, limit: usize) -> ApiResult<Vec<TenantGroupName>>;

    async fn tenants_in_group(
        &self,
        group: &TenantGroupName,
        limit: usize,
    ) -> ApiResult<BTreeSet<TenantId>>;

    /// Delete a tenant by name, provided it still has the expected id.
    async fn delete_tenant(&self, name: &TenantName, expected_id: TenantId) -> ApiResult<()>;

    /// Delete all of the given tenants atomically.
    async fn delete_tenants(&self, ids: &BTreeSet<TenantId>) -> ApiResult<()>;

    async fn registration(&self) -> ApiResult<Option<MetaclusterRegistration>>;

    /// Forget the metacluster this data cluster belongs to.
    async fn forget_metacluster(&self) -> ApiResult<()>;

    /// Clear the given key ranges.
    async fn clear_ranges(&self, ranges: &[KeyRange]) -> ApiResult<()>;
}

/// Opaque handle to a submitted backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTag(pub String);

#[async_trait]
pub trait BackupAgent: Send + Sync {
    /// Start a backup of `ranges` into `container_url`. Fails with
    /// `BackupDuplicate` if a backup with the same tag is running.
    async fn submit_backup(
        &self,
        cluster: &Arc<dyn DataClusterApi>,
        container_url: &str,
        tag: &BackupTag,
        ranges: &[KeyRange],
    ) -> ApiResult<()>;

    /// Wait for a stop-when-done backup to finish and return its container
    /// URL.
    async fn wait_backup(&self, cluster: &Arc<dyn DataClusterApi>, tag: &BackupTag)
        -> ApiResult<String>;

    /// Restore `ranges` of a backup into the cluster.
    async fn restore(
        &self,
        cluster: &Arc<dyn DataClusterApi>,
        tag: &BackupTag,
        container_url: &str,
        ranges: &[KeyRange],
    ) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_retried() {
        assert_eq!(ApiError::MetaclusterNoCapacity.class(), ErrorClass::Capacity);
        assert_eq!(ApiError::ClusterNoCapacity.class(), ErrorClass::Capacity);
    }

    #[test]
    fn collision_errors_are_classified() {
        assert_eq!(ApiError::TenantAlreadyExists.class(), ErrorClass::Collision);
        assert_eq!(ApiError::InvalidTenantConfiguration.class(), ErrorClass::Collision);
    }

    #[test]
    fn noop_and_cleanup_errors_are_classified() {
        assert_eq!(ApiError::BackupUnneeded.class(), ErrorClass::BackupNoop);
        assert_eq!(ApiError::BackupDuplicate.class(), ErrorClass::BackupNoop);
        assert_eq!(ApiError::ClusterNotFound.class(), ErrorClass::MissingCluster);
    }

    #[test]
    fn everything_else_is_fatal() {
        assert_eq!(ApiError::TenantNotFound.class(), ErrorClass::Fatal);
        assert_eq!(ApiError::TooManyTenants(3).class(), ErrorClass::Fatal);
        assert_eq!(
            ApiError::BackupNotFound("file://x".into()).class(),
            ErrorClass::Fatal
        );
    }
}
