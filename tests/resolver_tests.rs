//! Collision discovery and resolution while the management cluster is
//! rebuilt from data clusters that diverged through a lossy restore.

use test_helpers::{Harness, create_tracked, delete_tracked, harness, register_all, small_config};

use metarestore::api::{DataClusterApi, RestoreOptions};
use metarestore::checker;
use metarestore::directory::cluster_name;
use metarestore::orchestrator::{
    backup_cluster, reset_management_cluster, restore_data_cluster, restore_management_cluster,
};
use metarestore::resolver::{self, Collisions};
use metarestore::settings::RecoveryModeSetting;
use metarestore::types::{AccessTime, ClusterName, TenantId};
use metarestore::workload::MANAGEMENT_CLUSTER_NAME;
use std::sync::Arc;

const SHARED: &str = "tenant00000007";

fn both_mode(seed: u64) -> Harness {
    harness(&small_config(2, Some(RecoveryModeSetting::Both)), seed)
}

fn handle(h: &Harness, cluster: &ClusterName) -> Arc<dyn DataClusterApi> {
    h.sim.data_cluster(cluster).unwrap().clone()
}

/// Back up `cluster` and hand back the backup URL.
async fn backup(h: &Harness, cluster: &ClusterName) -> String {
    backup_cluster(&h.ctx, cluster).await.unwrap()
}

/// Leave `SHARED` on both clusters with different ids. The copy on cluster
/// 1 comes back from a backup taken before the tenant was deleted and then
/// recreated on cluster 0. Returns (stale id, live id).
async fn stale_copy_on_second_cluster(h: &Harness) -> (TenantId, TenantId) {
    let (c0, c1) = (cluster_name(0), cluster_name(1));
    let filler = create_tracked(h, "filler0", None, AccessTime::BeforeBackup).await;
    assert_eq!(filler.assigned_cluster, c0);
    let stale = create_tracked(h, SHARED, None, AccessTime::BeforeBackup).await;
    assert_eq!(stale.assigned_cluster, c1);

    let url = backup(h, &c1).await;
    delete_tracked(h, SHARED).await;
    create_tracked(h, "filler1", None, AccessTime::AfterBackup).await;
    let live = create_tracked(h, SHARED, None, AccessTime::AfterBackup).await;
    assert_eq!(live.assigned_cluster, c0);

    restore_data_cluster(&h.ctx, &c1, &url, false, false).await.unwrap();
    (stale.id, live.id)
}

#[metarestore::test(start_paused = true)]
async fn get_collisions_pairs_data_and_management_ids() {
    let h = both_mode(21);
    register_all(&h, 10).await;
    let (stale, live) = stale_copy_on_second_cluster(&h).await;
    let (c0, c1) = (cluster_name(0), cluster_name(1));

    reset_management_cluster(&h.ctx).await.unwrap();
    h.ctx
        .management
        .create_metacluster(MANAGEMENT_CLUSTER_NAME, 3)
        .await
        .unwrap();
    let first = handle(&h, &c0);
    first.forget_metacluster().await.unwrap();
    let options = RestoreOptions {
        apply_management_updates: false,
        dry_run: false,
        force_join: false,
    };
    h.ctx
        .management
        .restore_cluster(&c0, &first.connection_string(), options)
        .await
        .unwrap();

    let second = handle(&h, &c1);
    let collisions = resolver::get_collisions(&h.ctx, &second).await.unwrap();
    assert_eq!(collisions.tenants.len(), 1);
    assert_eq!(collisions.tenants[SHARED], (stale, live));
    assert!(collisions.groups.is_empty());

    // The model only knows the live copy, so the data cluster's copy goes.
    resolver::resolve_collisions(&h.ctx, &c1, &second, &collisions)
        .await
        .unwrap();
    assert!(h.sim.data_cluster(&c1).unwrap().image().tenants.is_empty());
    assert_eq!(
        h.ctx.management.get_tenant(&SHARED.to_string()).await.unwrap().id,
        live
    );
    assert!(
        resolver::get_collisions(&h.ctx, &second)
            .await
            .unwrap()
            .is_empty()
    );

    second.forget_metacluster().await.unwrap();
    h.ctx
        .management
        .restore_cluster(&c1, &second.connection_string(), options)
        .await
        .unwrap();
    checker::check(&h.ctx).await.unwrap();
}

#[metarestore::test(start_paused = true)]
async fn rebuild_keeps_the_copy_the_model_expects() {
    let h = both_mode(22);
    register_all(&h, 10).await;
    let (c0, c1) = (cluster_name(0), cluster_name(1));

    // The stale copy lands on cluster 0, which is rebuilt first, so the
    // management copy is the one that has to go.
    let stale = create_tracked(&h, SHARED, None, AccessTime::BeforeBackup).await;
    assert_eq!(stale.assigned_cluster, c0);
    let url = backup(&h, &c0).await;
    delete_tracked(&h, SHARED).await;
    create_tracked(&h, "filler", None, AccessTime::AfterBackup).await;
    let live = create_tracked(&h, SHARED, None, AccessTime::AfterBackup).await;
    assert_eq!(live.assigned_cluster, c1);
    restore_data_cluster(&h.ctx, &c0, &url, false, false).await.unwrap();

    reset_management_cluster(&h.ctx).await.unwrap();
    restore_management_cluster(&h.ctx).await.unwrap();

    let entry = h.ctx.management.get_tenant(&SHARED.to_string()).await.unwrap();
    assert_eq!(entry.id, live.id);
    assert_eq!(entry.assigned_cluster, c1);
    assert!(h.sim.data_cluster(&c0).unwrap().image().tenants.is_empty());
    assert!(h.ctx.model().was_deleted(stale.id));
    checker::check(&h.ctx).await.unwrap();
}

#[metarestore::test(start_paused = true)]
async fn rebuild_resolves_a_stale_data_copy() {
    let h = both_mode(23);
    register_all(&h, 10).await;
    let (stale, live) = stale_copy_on_second_cluster(&h).await;

    reset_management_cluster(&h.ctx).await.unwrap();
    restore_management_cluster(&h.ctx).await.unwrap();

    let tenants = h.ctx.management.list_tenants(10).await.unwrap();
    assert!(tenants.iter().all(|(id, _)| *id != stale));
    assert!(tenants.iter().any(|(id, _)| *id == live));
    assert!(
        h.sim
            .data_cluster(&cluster_name(1))
            .unwrap()
            .image()
            .tenants
            .is_empty()
    );
    checker::check(&h.ctx).await.unwrap();
}

#[metarestore::test(start_paused = true)]
async fn group_collision_drops_the_copy_on_the_wrong_cluster() {
    let h = both_mode(24);
    register_all(&h, 10).await;
    let (c0, c1) = (cluster_name(0), cluster_name(1));

    let old = create_tracked(&h, "a", Some("g"), AccessTime::BeforeBackup).await;
    assert_eq!(old.assigned_cluster, c0);
    let url = backup(&h, &c0).await;
    delete_tracked(&h, "a").await;
    create_tracked(&h, "filler", None, AccessTime::AfterBackup).await;
    let new = create_tracked(&h, "b", Some("g"), AccessTime::AfterBackup).await;
    assert_eq!(new.assigned_cluster, c1);
    restore_data_cluster(&h.ctx, &c0, &url, false, false).await.unwrap();

    reset_management_cluster(&h.ctx).await.unwrap();
    restore_management_cluster(&h.ctx).await.unwrap();

    let groups = h.ctx.management.tenant_groups(10).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, "g");
    assert_eq!(groups[0].1.assigned_cluster, c1);
    let members = h
        .ctx
        .management
        .tenants_in_group(&"g".to_string(), 10)
        .await
        .unwrap();
    assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![new.id]);
    assert!(h.sim.data_cluster(&c0).unwrap().image().tenants.is_empty());
    checker::check(&h.ctx).await.unwrap();
}

#[metarestore::test(start_paused = true)]
async fn group_collision_keeps_the_owner_already_in_the_directory() {
    let h = both_mode(25);
    register_all(&h, 10).await;
    let (c0, c1) = (cluster_name(0), cluster_name(1));

    create_tracked(&h, "filler0", None, AccessTime::BeforeBackup).await;
    let old = create_tracked(&h, "a", Some("g"), AccessTime::BeforeBackup).await;
    assert_eq!(old.assigned_cluster, c1);
    let url = backup(&h, &c1).await;
    delete_tracked(&h, "a").await;
    create_tracked(&h, "filler1", None, AccessTime::AfterBackup).await;
    let new = create_tracked(&h, "b", Some("g"), AccessTime::AfterBackup).await;
    assert_eq!(new.assigned_cluster, c0);
    restore_data_cluster(&h.ctx, &c1, &url, false, false).await.unwrap();

    // Cluster 0 is merged first and carries the group the model expects.
    reset_management_cluster(&h.ctx).await.unwrap();
    h.ctx
        .management
        .create_metacluster(MANAGEMENT_CLUSTER_NAME, 3)
        .await
        .unwrap();
    let first = handle(&h, &c0);
    first.forget_metacluster().await.unwrap();
    let options = RestoreOptions {
        apply_management_updates: false,
        dry_run: false,
        force_join: false,
    };
    h.ctx
        .management
        .restore_cluster(&c0, &first.connection_string(), options)
        .await
        .unwrap();

    let second = handle(&h, &c1);
    let collisions = resolver::get_collisions(&h.ctx, &second).await.unwrap();
    assert!(collisions.tenants.is_empty());
    assert_eq!(collisions.groups.iter().collect::<Vec<_>>(), vec!["g"]);

    // The model places `g` on cluster 0, so the members on cluster 1 go.
    resolver::resolve_collisions(&h.ctx, &c1, &second, &collisions)
        .await
        .unwrap();
    assert!(h.sim.data_cluster(&c1).unwrap().image().tenants.is_empty());
    assert!(h.ctx.model().was_deleted(old.id));
    let members = h
        .ctx
        .management
        .tenants_in_group(&"g".to_string(), 10)
        .await
        .unwrap();
    assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![new.id]);

    second.forget_metacluster().await.unwrap();
    h.ctx
        .management
        .restore_cluster(&c1, &second.connection_string(), options)
        .await
        .unwrap();
    let groups = h.ctx.management.tenant_groups(10).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].1.assigned_cluster, c0);
    checker::check(&h.ctx).await.unwrap();
}

#[metarestore::test]
fn collisions_explain_only_matching_errors() {
    use metarestore::api::ApiError;

    let mut collisions = Collisions::default();
    assert!(collisions.is_empty());
    assert!(!collisions.explains(&ApiError::TenantAlreadyExists));

    collisions.tenants.insert(SHARED.to_string(), (1, 2));
    assert!(collisions.explains(&ApiError::TenantAlreadyExists));
    assert!(!collisions.explains(&ApiError::InvalidTenantConfiguration));
    assert!(!collisions.explains(&ApiError::ClusterNotFound));

    collisions.groups.insert("g".to_string());
    assert!(collisions.explains(&ApiError::InvalidTenantConfiguration));

    collisions.clear();
    assert!(collisions.is_empty());
}

#[metarestore::test]
fn oversized_reads_are_rejected() {
    use metarestore::api::ApiError;

    assert_eq!(resolver::bounded(vec![1, 2, 3], 3).unwrap(), vec![1, 2, 3]);
    assert_eq!(
        resolver::bounded(vec![1, 2, 3, 4], 3).unwrap_err(),
        ApiError::TooManyTenants(4)
    );
}
