//! Collision discovery and resolution for management cluster rebuilds.
//!
//! When a data cluster's directory is merged into a rebuilt management
//! directory, tenant names and tenant group names present on both sides
//! block the merge. The reference model decides which copy survives; the
//! other is deleted and the model forgets it.

use futures::future::{BoxFuture, try_join_all};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{ApiError, ApiResult, DataClusterApi};
use crate::orchestrator::RecoveryError;
use crate::types::{ClusterName, TenantGroupName, TenantId, TenantName};
use crate::workload::RecoveryContext;

/// Tenant name -> (data cluster id, management cluster id).
pub type TenantCollisions = BTreeMap<TenantName, (TenantId, TenantId)>;

pub type GroupCollisions = BTreeSet<TenantGroupName>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collisions {
    pub tenants: TenantCollisions,
    pub groups: GroupCollisions,
}

impl Collisions {
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty() && self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.tenants.clear();
        self.groups.clear();
    }

    /// Whether a failed restore is accounted for by the known collisions.
    pub fn explains(&self, error: &ApiError) -> bool {
        match error {
            ApiError::TenantAlreadyExists => !self.tenants.is_empty(),
            ApiError::InvalidTenantConfiguration => !self.groups.is_empty(),
            _ => false,
        }
    }
}

/// Reject a directory read that returned more than `limit` entries.
pub fn within_limit(count: usize, limit: usize) -> ApiResult<()> {
    if count > limit {
        return Err(ApiError::TooManyTenants(count));
    }
    Ok(())
}

pub fn bounded<T>(entries: Vec<T>, limit: usize) -> ApiResult<Vec<T>> {
    within_limit(entries.len(), limit)?;
    Ok(entries)
}

/// Intersect the management directory's tenant names and groups with those
/// of `data`.
pub async fn get_collisions(
    ctx: &RecoveryContext,
    data: &Arc<dyn DataClusterApi>,
) -> Result<Collisions, RecoveryError> {
    let limit = ctx.max_tenants_per_cluster();
    let management_tenants: BTreeMap<TenantName, TenantId> =
        bounded(ctx.management.tenant_name_index(limit + 1).await?, limit)?
            .into_iter()
            .collect();
    let management_groups: BTreeSet<TenantGroupName> =
        bounded(ctx.management.tenant_groups(limit + 1).await?, limit)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
    let data_tenants = bounded(data.tenant_name_index(limit + 1).await?, limit)?;
    let data_groups = bounded(data.tenant_groups(limit + 1).await?, limit)?;

    let tenants = data_tenants
        .into_iter()
        .filter_map(|(name, data_id)| {
            let management_id = *management_tenants.get(&name)?;
            Some((name, (data_id, management_id)))
        })
        .collect();
    let groups = data_groups
        .into_iter()
        .filter(|g| management_groups.contains(g))
        .collect();
    Ok(Collisions { tenants, groups })
}

/// Delete the losing copy of every colliding tenant and wait for all
/// deletions. The data cluster copy wins if the model expects it.
pub async fn resolve_tenant_collisions(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
    data: &Arc<dyn DataClusterApi>,
    collisions: &TenantCollisions,
) -> Result<(), RecoveryError> {
    info!(cluster = %cluster, collisions = collisions.len(), "deleting tenant collisions");
    let mut removed = Vec::with_capacity(collisions.len());
    let mut deletes: Vec<BoxFuture<'_, ApiResult<()>>> = Vec::with_capacity(collisions.len());
    {
        let model = ctx.model();
        for (name, &(data_id, management_id)) in collisions {
            if model.is_alive(data_id) {
                debug!(tenant = %name, tenant_id = management_id, from = "management", "deleting tenant collision");
                removed.push(management_id);
                deletes.push(ctx.management.delete_tenant_by_id(management_id));
            } else {
                debug!(tenant = %name, tenant_id = data_id, from = "data", "deleting tenant collision");
                removed.push(data_id);
                deletes.push(data.delete_tenant(name, data_id));
            }
        }
    }

    try_join_all(deletes).await?;
    let mut model = ctx.model();
    for id in removed {
        model.record_delete(id);
    }
    Ok(())
}

/// Delete every member of the losing copy of each colliding group. If the
/// model places the group on `cluster`, the management copy loses;
/// otherwise the data cluster copy loses and its members are deleted in one
/// transaction.
pub async fn resolve_group_collisions(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
    data: &Arc<dyn DataClusterApi>,
    collisions: &GroupCollisions,
) -> Result<(), RecoveryError> {
    info!(cluster = %cluster, collisions = collisions.len(), "deleting tenant group collisions");
    let limit = ctx.max_tenants_per_cluster();
    let mut management_deletes = BTreeSet::new();
    let mut data_deletes = Vec::new();
    for group in collisions {
        let owned_here = ctx
            .model()
            .group(group)
            .is_some_and(|g| &g.cluster == cluster);
        if owned_here {
            debug!(group = %group, from = "management", "deleting tenant group collision");
            let members = ctx.management.tenants_in_group(group, limit + 1).await?;
            within_limit(members.len(), limit)?;
            management_deletes.extend(members);
        } else {
            debug!(group = %group, from = "data", "deleting tenant group collision");
            let members = data.tenants_in_group(group, limit + 1).await?;
            within_limit(members.len(), limit)?;
            data_deletes.push(members);
        }
    }

    let mut deletes: Vec<BoxFuture<'_, ApiResult<()>>> = management_deletes
        .iter()
        .map(|id| ctx.management.delete_tenant_by_id(*id))
        .collect();
    deletes.extend(data_deletes.iter().map(|members| data.delete_tenants(members)));
    try_join_all(deletes).await?;

    let mut model = ctx.model();
    for id in management_deletes.iter().chain(data_deletes.iter().flatten()) {
        model.record_delete(*id);
    }
    Ok(())
}

/// Resolve a collision set completely: tenants first, then groups.
pub async fn resolve_collisions(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
    data: &Arc<dyn DataClusterApi>,
    collisions: &Collisions,
) -> Result<(), RecoveryError> {
    resolve_tenant_collisions(ctx, cluster, data, &collisions.tenants).await?;
    resolve_group_collisions(ctx, cluster, data, &collisions.groups).await
}
