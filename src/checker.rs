//! Post-recovery verification.
//!
//! Every check is read-only and fails hard: the first divergence that is
//! not one of the legal lossy-recovery outcomes is returned as a
//! `ConsistencyViolation`.

use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};

use crate::api::ApiError;
use crate::resolver::bounded;
use crate::types::{AccessTime, ClusterName, ClusterType, TenantId, TenantMapEntry, TenantState};
use crate::workload::RecoveryContext;

#[derive(Debug, thiserror::Error)]
pub enum ConsistencyViolation {
    #[error("reading state to check failed: {0}")]
    Read(#[from] ApiError),
    #[error("consistency violation: {0}")]
    Violation(String),
}

macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(ConsistencyViolation::Violation(format!($($arg)+)));
        }
    };
}

/// Check that a data cluster's registration and tenant map agree with the
/// reference model.
pub async fn check_data_cluster(
    ctx: &RecoveryContext,
    cluster: &ClusterName,
) -> Result<(), ConsistencyViolation> {
    let (handle, restored) = {
        let directory = ctx.directory();
        let handle = directory.handle(cluster).ok_or(ApiError::ClusterNotFound)?;
        (handle, directory.is_restored(cluster))
    };
    let limit = ctx.max_tenants_per_cluster();
    let registration = handle.registration().await?;
    let tenants = bounded(handle.list_tenants(limit + 1).await?, limit)?;

    check!(
        registration
            .as_ref()
            .is_some_and(|r| r.cluster_type == ClusterType::Data),
        "data cluster {cluster} has registration {registration:?}"
    );

    let model = ctx.model();
    let expected_ids = model
        .cluster(cluster)
        .map(|c| c.tenants.clone())
        .unwrap_or_default();

    if !restored {
        check!(
            tenants.len() == expected_ids.len(),
            "data cluster {cluster} has {} tenants, expected {}",
            tenants.len(),
            expected_ids.len()
        );
        for (id, entry) in &tenants {
            check!(expected_ids.contains(id), "unexpected tenant {id} on {cluster}");
            let Some(data) = model.tenant(*id) else {
                return Err(ConsistencyViolation::Violation(format!(
                    "tenant {id} on {cluster} is not tracked"
                )));
            };
            check!(&data.cluster == cluster, "tenant {id} tracked on {}", data.cluster);
            check!(
                data.tenant_group == entry.tenant_group,
                "tenant {id} has group {:?}, expected {:?}",
                entry.tenant_group,
                data.tenant_group
            );
            check!(
                data.name == entry.name,
                "tenant {id} is named {}, expected {}",
                entry.name,
                data.name
            );
        }
        return Ok(());
    }

    let recover_management = ctx.recover_management();
    let tenant_map: BTreeMap<TenantId, _> = tenants.into_iter().collect();
    let mut expected_count = 0usize;
    for id in &expected_ids {
        let Some(data) = model.tenant(*id) else {
            return Err(ConsistencyViolation::Violation(format!(
                "tenant {id} listed on {cluster} is not tracked"
            )));
        };
        let present = tenant_map.get(id);
        match data.create_time {
            AccessTime::BeforeBackup => {
                expected_count += 1;
                let Some(entry) = present else {
                    return Err(ConsistencyViolation::Violation(format!(
                        "tenant {id} ({}) created before the backup is missing from {cluster}",
                        data.name
                    )));
                };
                check!(&data.cluster == cluster, "tenant {id} tracked on {}", data.cluster);
                if !recover_management || data.configure_time <= AccessTime::BeforeBackup {
                    check!(
                        entry.tenant_group == data.tenant_group,
                        "restored tenant {id} has group {:?}, expected {:?}",
                        entry.tenant_group,
                        data.tenant_group
                    );
                }
                if !recover_management || data.rename_time <= AccessTime::BeforeBackup {
                    check!(
                        entry.name == data.name,
                        "restored tenant {id} is named {}, expected {}",
                        entry.name,
                        data.name
                    );
                }
            }
            AccessTime::AfterBackup => {
                check!(
                    present.is_none(),
                    "tenant {id} ({}) created after the backup survived the restore of {cluster}",
                    data.name
                );
            }
            // Created while the backup ran: the backup may or may not have
            // captured it.
            AccessTime::DuringBackup | AccessTime::None => {
                if present.is_some() {
                    expected_count += 1;
                }
            }
        }
    }

    let mut unexpected = 0usize;
    for id in tenant_map.keys() {
        if !expected_ids.contains(id) {
            check!(
                recover_management,
                "deleted tenant {id} reappeared on {cluster} without a management recovery"
            );
            check!(model.was_deleted(*id), "unknown tenant {id} on {cluster}");
            unexpected += 1;
        }
    }

    check!(
        tenant_map.len() - unexpected == expected_count,
        "restored cluster {cluster} has {} tracked tenants, expected {expected_count}",
        tenant_map.len() - unexpected
    );
    Ok(())
}

/// Check the management cluster's tenant map against the reference model
/// and, when it was not rebuilt, against its pre-restore snapshot.
pub async fn check_tenants(ctx: &RecoveryContext) -> Result<(), ConsistencyViolation> {
    let limit = ctx.max_tenants_per_cluster();
    let tenants = bounded(ctx.management.list_tenants(limit + 1).await?, limit)?;
    let tenant_map: BTreeMap<TenantId, TenantMapEntry> = tenants.into_iter().collect();
    let before = ctx.management_tenants_before_restore();

    let model = ctx.model();
    let directory = ctx.directory();

    for (id, entry) in &before {
        let Some(post) = tenant_map.get(id) else {
            return Err(ConsistencyViolation::Violation(format!(
                "tenant {id} ({}) disappeared from the management cluster",
                entry.name
            )));
        };
        let mut post = post.clone();
        if post.state == TenantState::Error {
            check!(
                directory.is_restored(&post.assigned_cluster),
                "tenant {id} is in error but {} was not restored",
                post.assigned_cluster
            );
            post.state = entry.state;
            post.error.clear();
        }
        check!(
            &post == entry,
            "tenant {id} changed during recovery: {entry:?} -> {post:?}"
        );
    }
    if !before.is_empty() {
        check!(
            before.len() == tenant_map.len(),
            "management cluster has {} tenants, had {} before the restore",
            tenant_map.len(),
            before.len()
        );
    }

    for (id, data) in model.tenants() {
        let restored = directory.is_restored(&data.cluster);
        match tenant_map.get(id) {
            None => {
                check!(
                    data.create_time != AccessTime::BeforeBackup,
                    "tenant {id} ({}) created before the backup is missing from the management cluster",
                    data.name
                );
                check!(
                    restored && ctx.recover_management(),
                    "tenant {id} ({}) is missing from the management cluster",
                    data.name
                );
            }
            Some(entry) if data.create_time != AccessTime::BeforeBackup && restored => {
                check!(
                    entry.state == TenantState::Error
                        || (entry.state == TenantState::Ready
                            && data.create_time == AccessTime::DuringBackup),
                    "tenant {id} created {} is {} after its cluster was restored",
                    data.create_time,
                    entry.state
                );
                if entry.state == TenantState::Error {
                    check!(
                        directory.restore_has_messages(&data.cluster),
                        "tenant {id} is in error but the restore of {} reported nothing",
                        data.cluster
                    );
                }
            }
            Some(entry) => {
                check!(
                    entry.state == TenantState::Ready,
                    "tenant {id} is {} ({})",
                    entry.state,
                    entry.error
                );
            }
        }
    }

    for id in tenant_map.keys() {
        if !model.is_alive(*id) {
            check!(model.was_deleted(*id), "management cluster has unknown tenant {id}");
            check!(
                ctx.recover_management() && ctx.recover_data(),
                "deleted tenant {id} reappeared without a lossy recovery"
            );
        }
    }
    Ok(())
}

/// Structural consistency of the metacluster as a whole: registrations,
/// cluster assignment, unique names and non-empty groups on one cluster,
/// and agreement between the management directory and each data cluster.
pub async fn check_metacluster(ctx: &RecoveryContext) -> Result<(), ConsistencyViolation> {
    let limit = ctx.max_tenants_per_cluster();
    let registration = ctx.management.registration().await?;
    let Some(registration) =
        registration.filter(|r| r.cluster_type == ClusterType::Management)
    else {
        return Err(ConsistencyViolation::Violation(
            "management cluster is not registered as a metacluster".to_string(),
        ));
    };

    let tenants: BTreeMap<TenantId, TenantMapEntry> =
        bounded(ctx.management.list_tenants(limit + 1).await?, limit)?
            .into_iter()
            .collect();
    let name_index = bounded(ctx.management.tenant_name_index(limit + 1).await?, limit)?;
    let groups = bounded(ctx.management.tenant_groups(limit + 1).await?, limit)?;

    check!(
        name_index.len() == tenants.len(),
        "name index has {} entries for {} tenants",
        name_index.len(),
        tenants.len()
    );
    for (name, id) in &name_index {
        check!(
            tenants.get(id).is_some_and(|t| &t.name == name),
            "name index entry {name} -> {id} does not match the tenant map"
        );
    }

    for (group, entry) in &groups {
        let members = ctx.management.tenants_in_group(group, limit + 1).await?;
        check!(!members.is_empty(), "tenant group {group} has no members");
        for id in &members {
            check!(
                tenants
                    .get(id)
                    .is_some_and(|t| t.assigned_cluster == entry.assigned_cluster),
                "tenant {id} in group {group} is not on {}",
                entry.assigned_cluster
            );
        }
    }

    let handles: Vec<_> = {
        let directory = ctx.directory();
        directory
            .names()
            .iter()
            .filter_map(|name| directory.handle(name).map(|h| (name.clone(), h)))
            .collect()
    };
    let mut registered = BTreeSet::new();
    for (name, handle) in &handles {
        ctx.management.get_cluster(name).await?;
        registered.insert(name.clone());

        let data_registration = handle.registration().await?;
        check!(
            data_registration.as_ref().is_some_and(|r| r.cluster_type == ClusterType::Data
                && r.metacluster_id == registration.metacluster_id
                && &r.name == name),
            "data cluster {name} has registration {data_registration:?}"
        );

        let data_tenants: BTreeMap<TenantId, _> =
            bounded(handle.list_tenants(limit + 1).await?, limit)?
                .into_iter()
                .collect();
        for (id, entry) in tenants.iter().filter(|(_, t)| &t.assigned_cluster == name) {
            if entry.state != TenantState::Ready {
                continue;
            }
            let Some(data) = data_tenants.get(id) else {
                return Err(ConsistencyViolation::Violation(format!(
                    "ready tenant {id} ({}) is missing from {name}",
                    entry.name
                )));
            };
            check!(
                data.name == entry.name && data.tenant_group == entry.tenant_group,
                "tenant {id} differs between the management cluster and {name}"
            );
        }
        for id in data_tenants.keys() {
            check!(
                tenants.get(id).is_some_and(|t| &t.assigned_cluster == name),
                "tenant {id} on {name} is not assigned to it"
            );
        }
    }

    for (id, entry) in &tenants {
        check!(
            registered.contains(&entry.assigned_cluster),
            "tenant {id} is assigned to unregistered cluster {}",
            entry.assigned_cluster
        );
    }
    Ok(())
}

/// Run every check: the metacluster structure, each data cluster, then the
/// management tenant map.
pub async fn check(ctx: &RecoveryContext) -> Result<(), ConsistencyViolation> {
    ctx.model()
        .validate()
        .map_err(ConsistencyViolation::Violation)?;
    check_metacluster(ctx).await?;

    let clusters = ctx.directory().names().to_vec();
    try_join_all(clusters.iter().map(|cluster| check_data_cluster(ctx, cluster))).await?;
    check_tenants(ctx).await
}
