//! Behavior of the simulated metacluster that the recovery engine relies on:
//! tenant placement, capacity accounting, both restore modes and the
//! tenant-scoped keyspace.

use test_helpers::{
    create_tracked, delete_tracked, finish_backup, harness, register_all, small_config,
    start_backup,
};

use metarestore::api::{ApiError, BackupAgent, BackupTag, DataClusterApi, RestoreOptions};
use metarestore::directory::cluster_name;
use metarestore::keys::{default_backup_ranges, tenant_id_from_key, tenant_key};
use metarestore::orchestrator::backup_container;
use metarestore::tenant_info::{StaticTokenCache, TenantInfo, WipedString};
use metarestore::types::{AccessTime, ClusterType, TenantState};
use std::sync::Arc;

const REBUILD: RestoreOptions = RestoreOptions {
    apply_management_updates: false,
    dry_run: false,
    force_join: false,
};

const APPLY: RestoreOptions = RestoreOptions {
    apply_management_updates: true,
    dry_run: false,
    force_join: false,
};

#[metarestore::test(start_paused = true)]
async fn tenants_go_to_least_allocated_cluster() {
    let h = harness(&small_config(2, None), 1);
    register_all(&h, 1).await;

    let a = create_tracked(&h, "a", None, AccessTime::BeforeBackup).await;
    let b = create_tracked(&h, "b", None, AccessTime::BeforeBackup).await;
    assert_eq!(a.assigned_cluster, cluster_name(0));
    assert_eq!(b.assigned_cluster, cluster_name(1));
    assert_eq!(a.state, TenantState::Ready);
    assert!(b.id > a.id);

    let err = h
        .ctx
        .management
        .create_tenant(&"c".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::MetaclusterNoCapacity);

    h.ctx
        .management
        .update_cluster_capacities(&[cluster_name(0), cluster_name(1)], 2)
        .await
        .unwrap();
    let c = create_tracked(&h, "c", None, AccessTime::BeforeBackup).await;
    assert_eq!(c.assigned_cluster, cluster_name(0));
    assert_eq!(
        h.ctx.management.get_cluster(&cluster_name(0)).await.unwrap().allocated,
        2
    );
}

#[metarestore::test(start_paused = true)]
async fn grouped_tenants_share_a_cluster_and_one_slot() {
    let h = harness(&small_config(2, None), 2);
    register_all(&h, 2).await;

    let a = create_tracked(&h, "a", Some("g"), AccessTime::BeforeBackup).await;
    let b = create_tracked(&h, "b", Some("g"), AccessTime::BeforeBackup).await;
    assert_eq!(a.assigned_cluster, b.assigned_cluster);
    let entry = h.ctx.management.get_cluster(&a.assigned_cluster).await.unwrap();
    assert_eq!(entry.allocated, 1);

    let c = create_tracked(&h, "c", None, AccessTime::BeforeBackup).await;
    assert_ne!(c.assigned_cluster, a.assigned_cluster);

    // A group can never span clusters.
    let err = h
        .ctx
        .management
        .configure_tenant_group(&"c".to_string(), Some(&"g".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::InvalidTenantConfiguration);

    let groups = h.ctx.management.tenant_groups(10).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].1.assigned_cluster, a.assigned_cluster);

    let data = h.sim.data_cluster(&a.assigned_cluster).unwrap().image();
    assert_eq!(data.tenants_in_group("g").len(), 2);
}

#[metarestore::test(start_paused = true)]
async fn configure_checks_cluster_capacity() {
    let h = harness(&small_config(1, None), 3);
    register_all(&h, 2).await;

    create_tracked(&h, "a", Some("g"), AccessTime::BeforeBackup).await;
    create_tracked(&h, "b", Some("g"), AccessTime::BeforeBackup).await;
    create_tracked(&h, "c", None, AccessTime::BeforeBackup).await;

    // Moving `a` out of a shared group into a new one needs a free slot.
    let a = "a".to_string();
    let h_group = "h".to_string();
    let err = h
        .ctx
        .management
        .configure_tenant_group(&a, Some(&h_group))
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::ClusterNoCapacity);

    // Moving the ungrouped tenant into a new group frees as much as it takes.
    h.ctx
        .management
        .configure_tenant_group(&"c".to_string(), Some(&"k".to_string()))
        .await
        .unwrap();

    h.ctx
        .management
        .update_cluster_capacities(&[cluster_name(0)], 3)
        .await
        .unwrap();
    h.ctx
        .management
        .configure_tenant_group(&a, Some(&h_group))
        .await
        .unwrap();
    let entry = h.ctx.management.get_tenant(&a).await.unwrap();
    assert_eq!(entry.tenant_group.as_deref(), Some("h"));
    assert_eq!(
        h.ctx.management.get_cluster(&cluster_name(0)).await.unwrap().allocated,
        3
    );
}

#[metarestore::test(start_paused = true)]
async fn rename_and_delete_reach_the_data_cluster() {
    let h = harness(&small_config(1, None), 4);
    register_all(&h, 10).await;
    let a = create_tracked(&h, "a", Some("g"), AccessTime::BeforeBackup).await;
    let data = h.sim.data_cluster(&cluster_name(0)).unwrap().clone();

    h.ctx
        .management
        .rename_tenant(&"a".to_string(), &"renamed".to_string())
        .await
        .unwrap();
    assert_eq!(data.image().tenants[&a.id].name, "renamed");
    assert_eq!(
        h.ctx.management.get_tenant(&"a".to_string()).await.unwrap_err(),
        ApiError::TenantNotFound
    );

    h.ctx.management.delete_tenant_by_id(a.id).await.unwrap();
    assert!(data.image().tenants.is_empty());
    assert!(h.ctx.management.tenant_groups(10).await.unwrap().is_empty());
    assert_eq!(
        h.ctx.management.delete_tenant_by_id(a.id).await.unwrap_err(),
        ApiError::TenantNotFound
    );
}

#[metarestore::test(start_paused = true)]
async fn tenant_keyspace_is_gated_and_cleared_on_delete() {
    let h = harness(&small_config(1, None), 5);
    register_all(&h, 10).await;
    let a = create_tracked(&h, "a", None, AccessTime::BeforeBackup).await;
    let data = h.sim.data_cluster(&cluster_name(0)).unwrap().clone();

    let cache = StaticTokenCache::new();
    cache.grant(a.id, "secret");

    let anonymous = TenantInfo::new(a.id, None).authorize(false, false, &cache);
    assert_eq!(
        data.write(&anonymous, b"k", b"v").await.unwrap_err(),
        ApiError::PermissionDenied
    );

    let tenant = TenantInfo::new(a.id, Some(WipedString::new("secret"))).authorize(false, false, &cache);
    data.write(&tenant, b"k", b"v").await.unwrap();
    assert_eq!(data.read(&tenant, b"k").await.unwrap(), Some(b"v".to_vec()));
    assert!(data.image().data.contains_key(&tenant_key(a.id, b"k")));
    assert!(
        data.image()
            .data
            .keys()
            .all(|key| tenant_id_from_key(key) == Some(a.id))
    );

    let peer = TenantInfo::default().authorize(true, false, &cache);
    assert_eq!(data.read(&peer, b"k").await.unwrap(), None);
    assert_eq!(
        data.read(&peer, &tenant_key(a.id, b"k")).await.unwrap(),
        Some(b"v".to_vec())
    );

    h.ctx.management.delete_tenant(&"a".to_string()).await.unwrap();
    assert!(data.image().data.is_empty());
    assert_eq!(
        data.read(&tenant, b"k").await.unwrap_err(),
        ApiError::TenantNotFound
    );
}

#[metarestore::test(start_paused = true)]
async fn applying_management_updates_reconciles_a_restored_cluster() {
    let h = harness(&small_config(1, None), 6);
    register_all(&h, 10).await;
    let cluster = cluster_name(0);
    let data = h.sim.data_cluster(&cluster).unwrap().clone();
    let handle: Arc<dyn DataClusterApi> = data.clone();

    let a = create_tracked(&h, "a", None, AccessTime::BeforeBackup).await;
    let b = create_tracked(&h, "b", Some("g"), AccessTime::BeforeBackup).await;

    let tag = BackupTag(cluster.clone());
    let ranges = default_backup_ranges();
    let agent = &h.sim.backup_agent;
    agent
        .submit_backup(&handle, &backup_container(&cluster), &tag, &ranges)
        .await
        .unwrap();
    let url = agent.wait_backup(&handle, &tag).await.unwrap();

    // After the backup: `a` is deleted, `b` is renamed and `c` is created.
    h.ctx.management.delete_tenant(&"a".to_string()).await.unwrap();
    h.ctx
        .management
        .rename_tenant(&"b".to_string(), &"b2".to_string())
        .await
        .unwrap();
    let c = create_tracked(&h, "c", None, AccessTime::AfterBackup).await;

    handle.clear_ranges(&ranges).await.unwrap();
    agent.restore(&handle, &tag, &url, &ranges).await.unwrap();
    assert!(data.image().tenants.contains_key(&a.id));
    assert!(!data.image().tenants.contains_key(&c.id));

    let before_image = data.image();
    let before_tenants = h.ctx.management.list_tenants(10).await.unwrap();
    let conn = handle.connection_string();
    let dry_run = RestoreOptions {
        dry_run: true,
        ..APPLY
    };
    let messages = h
        .ctx
        .management
        .restore_cluster(&cluster, &conn, dry_run)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(data.image(), before_image);
    assert_eq!(h.ctx.management.list_tenants(10).await.unwrap(), before_tenants);

    let applied = h
        .ctx
        .management
        .restore_cluster(&cluster, &conn, APPLY)
        .await
        .unwrap();
    assert_eq!(applied, messages);

    let image = data.image();
    assert!(!image.tenants.contains_key(&a.id));
    assert_eq!(image.tenants[&b.id].name, "b2");
    assert_eq!(image.tenants[&b.id].tenant_group.as_deref(), Some("g"));

    let c_entry = h.ctx.management.get_tenant(&"c".to_string()).await.unwrap();
    assert_eq!(c_entry.state, TenantState::Error);
    assert!(!c_entry.error.is_empty());
    let b_entry = h.ctx.management.get_tenant(&"b2".to_string()).await.unwrap();
    assert_eq!(b_entry.state, TenantState::Ready);

    let registration = image.registration.unwrap();
    assert_eq!(registration.cluster_type, ClusterType::Data);
    assert_eq!(registration.name, cluster);
}

#[metarestore::test(start_paused = true)]
async fn applying_management_updates_requires_a_known_cluster() {
    let h = harness(&small_config(1, None), 7);
    register_all(&h, 10).await;
    let cluster = cluster_name(0);
    let conn = h.sim.data_cluster(&cluster).unwrap().connection_string();

    h.ctx.management.remove_cluster(&cluster).await.unwrap();
    let failure = h
        .ctx
        .management
        .restore_cluster(&cluster, &conn, APPLY)
        .await
        .unwrap_err();
    assert_eq!(failure.error, ApiError::ClusterNotFound);
}

#[metarestore::test(start_paused = true)]
async fn foreign_registration_needs_force_join() {
    let h = harness(&small_config(1, None), 8);
    register_all(&h, 10).await;
    let cluster = cluster_name(0);
    let conn = h.sim.data_cluster(&cluster).unwrap().connection_string();

    // A new metacluster incarnation no longer knows the cluster.
    h.ctx.management.erase().await.unwrap();
    h.ctx
        .management
        .create_metacluster("management_cluster", 9)
        .await
        .unwrap();

    let failure = h
        .ctx
        .management
        .restore_cluster(&cluster, &conn, REBUILD)
        .await
        .unwrap_err();
    assert_eq!(failure.error, ApiError::ClusterAlreadyRegistered);

    let forced = RestoreOptions {
        force_join: true,
        ..REBUILD
    };
    h.ctx
        .management
        .restore_cluster(&cluster, &conn, forced)
        .await
        .unwrap();
    let failure = h
        .ctx
        .management
        .restore_cluster(&cluster, &conn, forced)
        .await
        .unwrap_err();
    assert_eq!(failure.error, ApiError::ClusterAlreadyExists);
}

#[metarestore::test(start_paused = true)]
async fn rebuild_adopts_data_cluster_tenants_without_mutating_them() {
    let h = harness(&small_config(2, None), 9);
    register_all(&h, 10).await;
    for name in ["a", "b", "c"] {
        create_tracked(&h, name, Some("g"), AccessTime::BeforeBackup).await;
    }
    let d = create_tracked(&h, "d", None, AccessTime::BeforeBackup).await;

    h.ctx.management.erase().await.unwrap();
    h.ctx
        .management
        .create_metacluster("management_cluster", 7)
        .await
        .unwrap();

    for data in &h.sim.data_clusters {
        data.forget_metacluster().await.unwrap();
        let before = data.image().tenants;
        let conn = data.connection_string();

        let dry_run = RestoreOptions {
            dry_run: true,
            ..REBUILD
        };
        h.ctx
            .management
            .restore_cluster(data.name(), &conn, dry_run)
            .await
            .unwrap();
        assert!(matches!(
            h.ctx.management.get_cluster(data.name()).await,
            Err(ApiError::ClusterNotFound)
        ));

        h.ctx
            .management
            .restore_cluster(data.name(), &conn, REBUILD)
            .await
            .unwrap();
        assert_eq!(data.image().tenants, before);

        let entry = h.ctx.management.get_cluster(data.name()).await.unwrap();
        assert_eq!(entry.capacity, entry.allocated);
        let registration = data.image().registration.unwrap();
        assert_eq!(registration.cluster_type, ClusterType::Data);
    }

    assert_eq!(h.ctx.management.list_tenants(10).await.unwrap().len(), 4);
    let adopted = h.ctx.management.get_tenant(&"d".to_string()).await.unwrap();
    assert_eq!(adopted.id, d.id);
    assert_eq!(adopted.state, TenantState::Ready);

    // Ids allocated after the rebuild never reuse an adopted id.
    h.ctx
        .management
        .update_cluster_capacities(&[cluster_name(0), cluster_name(1)], 10)
        .await
        .unwrap();
    let e = create_tracked(&h, "e", None, AccessTime::AfterBackup).await;
    assert!(e.id > d.id);
}

#[metarestore::test(start_paused = true)]
async fn rebuild_with_collisions_reports_every_one() {
    let h = harness(&small_config(2, None), 10);
    register_all(&h, 10).await;
    let a = create_tracked(&h, "a", Some("g"), AccessTime::BeforeBackup).await;
    let b = create_tracked(&h, "b", None, AccessTime::BeforeBackup).await;
    assert_ne!(a.assigned_cluster, b.assigned_cluster);
    let first = h.sim.data_cluster(&a.assigned_cluster).unwrap().clone();
    let second = h.sim.data_cluster(&b.assigned_cluster).unwrap().clone();

    h.ctx.management.erase().await.unwrap();
    h.ctx
        .management
        .create_metacluster("management_cluster", 7)
        .await
        .unwrap();
    first.forget_metacluster().await.unwrap();
    h.ctx
        .management
        .restore_cluster(first.name(), &first.connection_string(), REBUILD)
        .await
        .unwrap();

    // Rebuilding the first cluster again under another name collides on
    // its tenant name and its group.
    let alias = "alias".to_string();
    let dry_run = RestoreOptions {
        dry_run: true,
        force_join: true,
        ..REBUILD
    };
    let failure = h
        .ctx
        .management
        .restore_cluster(&alias, &first.connection_string(), dry_run)
        .await
        .unwrap_err();
    assert_eq!(failure.error, ApiError::TenantAlreadyExists);
    assert_eq!(failure.messages.len(), 2);
    assert!(matches!(
        h.ctx.management.get_cluster(&alias).await,
        Err(ApiError::ClusterNotFound)
    ));

    // A committed attempt leaves the cluster entry behind.
    let failure = h
        .ctx
        .management
        .restore_cluster(
            &alias,
            &first.connection_string(),
            RestoreOptions {
                force_join: true,
                ..REBUILD
            },
        )
        .await
        .unwrap_err();
    assert_eq!(failure.error, ApiError::TenantAlreadyExists);
    assert!(h.ctx.management.get_cluster(&alias).await.is_ok());
    h.ctx.management.remove_cluster(&alias).await.unwrap();
    assert_eq!(
        h.ctx.management.remove_cluster(&alias).await.unwrap_err(),
        ApiError::ClusterNotFound
    );

    // The other cluster has nothing in common and goes straight in.
    second.forget_metacluster().await.unwrap();
    let messages = h
        .ctx
        .management
        .restore_cluster(second.name(), &second.connection_string(), REBUILD)
        .await
        .unwrap();
    assert!(messages.is_empty());
    assert_eq!(h.ctx.management.list_tenants(10).await.unwrap().len(), 2);
}

#[metarestore::test(start_paused = true)]
async fn duplicate_backups_and_unknown_containers_are_reported() {
    let h = harness(&small_config(1, None), 11);
    register_all(&h, 10).await;
    let cluster = cluster_name(0);
    let handle: Arc<dyn DataClusterApi> = h.sim.data_cluster(&cluster).unwrap().clone();
    let tag = BackupTag(cluster.clone());
    let ranges = default_backup_ranges();
    let agent = &h.sim.backup_agent;

    agent
        .submit_backup(&handle, &backup_container(&cluster), &tag, &ranges)
        .await
        .unwrap();
    assert_eq!(
        agent
            .submit_backup(&handle, &backup_container(&cluster), &tag, &ranges)
            .await
            .unwrap_err(),
        ApiError::BackupDuplicate
    );
    let url = agent.wait_backup(&handle, &tag).await.unwrap();
    assert_eq!(url, backup_container(&cluster));
    assert!(agent.container(&url).is_some());

    assert!(matches!(
        agent.wait_backup(&handle, &tag).await,
        Err(ApiError::BackupNotFound(_))
    ));
    assert!(matches!(
        agent.restore(&handle, &tag, "file://nowhere", &ranges).await,
        Err(ApiError::BackupNotFound(_))
    ));
}

#[metarestore::test(start_paused = true)]
async fn backups_capture_the_cluster_at_their_snapshot() {
    let h = harness(&small_config(1, None), 12);
    register_all(&h, 10).await;
    let cluster = cluster_name(0);
    let a = create_tracked(&h, "a", None, AccessTime::BeforeBackup).await;

    let tag = start_backup(&h, &cluster).await;
    assert!(h.sim.backup_agent.snapshot_taken(&tag));
    delete_tracked(&h, "a").await;
    let b = create_tracked(&h, "b", None, AccessTime::DuringBackup).await;
    let url = finish_backup(&h, &cluster, &tag).await;
    assert!(!h.sim.backup_agent.snapshot_taken(&tag));

    let image = h.sim.backup_agent.container(&url).unwrap();
    assert!(image.tenants.contains_key(&a.id));
    assert!(!image.tenants.contains_key(&b.id));
    let live = h.sim.data_cluster(&cluster).unwrap().image();
    assert!(!live.tenants.contains_key(&a.id));
    assert!(live.tenants.contains_key(&b.id));
}
