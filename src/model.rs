//! Reference model of the tenant directory.
//!
//! The model is the oracle for every recovery decision and check. It is
//! mutated only after the matching call against the live system has
//! committed, so it never describes uncommitted state.

use rand::Rng;
use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::types::{AccessTime, ClusterName, TenantGroupName, TenantId, TenantMapEntry, TenantName};

/// What the model knows about a live tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantData {
    pub name: TenantName,
    pub cluster: ClusterName,
    pub tenant_group: Option<TenantGroupName>,
    pub create_time: AccessTime,
    pub rename_time: AccessTime,
    pub configure_time: AccessTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantGroupData {
    pub cluster: ClusterName,
    pub tenants: BTreeSet<TenantId>,
}

/// Expected contents of one data cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTenants {
    pub tenants: BTreeSet<TenantId>,
    pub tenant_groups: BTreeSet<TenantGroupName>,
}

pub struct ReferenceModel {
    created_tenants: BTreeMap<TenantId, TenantData>,
    tenant_name_index: BTreeMap<TenantName, TenantId>,
    tenant_groups: BTreeMap<TenantGroupName, TenantGroupData>,
    deleted_tenants: BTreeSet<TenantId>,
    clusters: BTreeMap<ClusterName, ClusterTenants>,
    max_tenants: u32,
    max_tenant_groups: u32,
}

pub fn tenant_name(n: u32) -> TenantName {
    format!("tenant{:08}", n)
}

pub fn tenant_group_name(n: u32) -> TenantGroupName {
    format!("tenantgroup{:08}", n)
}

impl ReferenceModel {
    pub fn new<'a>(
        clusters: impl IntoIterator<Item = &'a ClusterName>,
        max_tenants: u32,
        max_tenant_groups: u32,
    ) -> Self {
        Self {
            created_tenants: BTreeMap::new(),
            tenant_name_index: BTreeMap::new(),
            tenant_groups: BTreeMap::new(),
            deleted_tenants: BTreeSet::new(),
            clusters: clusters
                .into_iter()
                .map(|c| (c.clone(), ClusterTenants::default()))
                .collect(),
            max_tenants: max_tenants.max(1),
            max_tenant_groups,
        }
    }

    // --- queries ---

    pub fn tenant(&self, id: TenantId) -> Option<&TenantData> {
        self.created_tenants.get(&id)
    }

    pub fn tenants(&self) -> &BTreeMap<TenantId, TenantData> {
        &self.created_tenants
    }

    pub fn tenant_count(&self) -> usize {
        self.created_tenants.len()
    }

    pub fn id_of(&self, name: &str) -> Option<TenantId> {
        self.tenant_name_index.get(name).copied()
    }

    pub fn is_alive(&self, id: TenantId) -> bool {
        self.created_tenants.contains_key(&id)
    }

    pub fn was_deleted(&self, id: TenantId) -> bool {
        self.deleted_tenants.contains(&id)
    }

    pub fn deleted_tenants(&self) -> &BTreeSet<TenantId> {
        &self.deleted_tenants
    }

    pub fn group(&self, name: &str) -> Option<&TenantGroupData> {
        self.tenant_groups.get(name)
    }

    pub fn groups(&self) -> &BTreeMap<TenantGroupName, TenantGroupData> {
        &self.tenant_groups
    }

    pub fn cluster(&self, name: &ClusterName) -> Option<&ClusterTenants> {
        self.clusters.get(name)
    }

    // --- random choices ---

    pub fn choose_tenant_name<R: Rng + ?Sized>(&self, rng: &mut R) -> TenantName {
        tenant_name(rng.random_range(0..self.max_tenants))
    }

    /// Sample up to `attempts` names, returning the first one that is
    /// currently in use.
    pub fn choose_existing_tenant<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        attempts: u32,
    ) -> Option<(TenantName, TenantId)> {
        (0..attempts).find_map(|_| {
            let name = self.choose_tenant_name(rng);
            self.id_of(&name).map(|id| (name, id))
        })
    }

    /// Sample up to `attempts` names, returning the first one that is free.
    pub fn choose_unused_tenant_name<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        attempts: u32,
    ) -> Option<TenantName> {
        (0..attempts).find_map(|_| {
            let name = self.choose_tenant_name(rng);
            (!self.tenant_name_index.contains_key(&name)).then_some(name)
        })
    }

    /// Pick a group for a tenant: half the time none. With a cluster hint,
    /// either an existing group on that cluster or a name no tracked group
    /// uses (only while the group budget allows).
    pub fn choose_tenant_group<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        cluster: Option<&ClusterName>,
    ) -> Option<TenantGroupName> {
        if self.max_tenant_groups == 0 || !rng.random_bool(0.5) {
            return None;
        }
        let Some(cluster) = cluster else {
            return Some(tenant_group_name(rng.random_range(0..self.max_tenant_groups)));
        };

        let existing = self.clusters.get(cluster).map(|c| &c.tenant_groups);
        if rng.random_bool(0.5) {
            if let Some(group) = existing.and_then(|groups| groups.iter().choose(rng)) {
                return Some(group.clone());
            }
        }
        if (self.tenant_groups.len() as u32) < self.max_tenant_groups {
            loop {
                let candidate = tenant_group_name(rng.random_range(0..self.max_tenant_groups));
                if !self.tenant_groups.contains_key(&candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    // --- mutations ---

    /// Track a tenant the system just created.
    pub fn record_create(&mut self, entry: &TenantMapEntry, access_time: AccessTime) -> TenantId {
        let id = entry.id;
        debug!(tenant = %entry.name, tenant_id = id, cluster = %entry.assigned_cluster, %access_time, "tracking created tenant");
        self.created_tenants.insert(
            id,
            TenantData {
                name: entry.name.clone(),
                cluster: entry.assigned_cluster.clone(),
                tenant_group: entry.tenant_group.clone(),
                create_time: access_time,
                rename_time: AccessTime::None,
                configure_time: AccessTime::None,
            },
        );
        self.tenant_name_index.insert(entry.name.clone(), id);
        let cluster = self
            .clusters
            .entry(entry.assigned_cluster.clone())
            .or_default();
        cluster.tenants.insert(id);
        if let Some(group) = &entry.tenant_group {
            let group_data = self.tenant_groups.entry(group.clone()).or_default();
            group_data.cluster = entry.assigned_cluster.clone();
            group_data.tenants.insert(id);
            cluster.tenant_groups.insert(group.clone());
        }
        id
    }

    /// Stop tracking a tenant and remember that it existed. Unknown ids are
    /// ignored. A group left without members is dropped with it.
    pub fn record_delete(&mut self, id: TenantId) {
        let Some(data) = self.created_tenants.remove(&id) else {
            return;
        };
        debug!(tenant = %data.name, tenant_id = id, "removing tracked tenant");
        self.deleted_tenants.insert(id);
        if self.tenant_name_index.get(&data.name) == Some(&id) {
            self.tenant_name_index.remove(&data.name);
        }
        if let Some(cluster) = self.clusters.get_mut(&data.cluster) {
            cluster.tenants.remove(&id);
        }
        if let Some(group) = &data.tenant_group {
            self.leave_group(id, group, &data.cluster);
        }
    }

    pub fn record_rename(&mut self, id: TenantId, new_name: &TenantName, access_time: AccessTime) {
        let Some(data) = self.created_tenants.get_mut(&id) else {
            return;
        };
        if self.tenant_name_index.get(&data.name) == Some(&id) {
            self.tenant_name_index.remove(&data.name);
        }
        data.name = new_name.clone();
        data.rename_time = access_time;
        self.tenant_name_index.insert(new_name.clone(), id);
    }

    /// Move a tenant to `new_group`. A no-op (including the access-time
    /// marker) if the group is unchanged.
    pub fn record_configure(
        &mut self,
        id: TenantId,
        new_group: Option<&TenantGroupName>,
        access_time: AccessTime,
    ) {
        let Some(data) = self.created_tenants.get(&id) else {
            return;
        };
        if data.tenant_group.as_ref() == new_group {
            return;
        }
        let cluster = data.cluster.clone();
        let old_group = data.tenant_group.clone();
        if let Some(old) = &old_group {
            self.leave_group(id, old, &cluster);
        }
        if let Some(group) = new_group {
            let group_data = self.tenant_groups.entry(group.clone()).or_default();
            group_data.cluster = cluster.clone();
            group_data.tenants.insert(id);
            self.clusters
                .entry(cluster)
                .or_default()
                .tenant_groups
                .insert(group.clone());
        }
        if let Some(data) = self.created_tenants.get_mut(&id) {
            data.tenant_group = new_group.cloned();
            data.configure_time = access_time;
        }
    }

    fn leave_group(&mut self, id: TenantId, group: &TenantGroupName, cluster: &ClusterName) {
        let now_empty = match self.tenant_groups.get_mut(group) {
            Some(group_data) => {
                group_data.tenants.remove(&id);
                group_data.tenants.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.tenant_groups.remove(group);
            if let Some(cluster) = self.clusters.get_mut(cluster) {
                cluster.tenant_groups.remove(group);
            }
        }
    }

    /// Verify the model's internal invariants: unique names, a consistent
    /// name index, no empty groups and per-cluster sets that agree with the
    /// tenant records.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_name_index.len() != self.created_tenants.len() {
            return Err(format!(
                "name index has {} entries for {} tenants",
                self.tenant_name_index.len(),
                self.created_tenants.len()
            ));
        }
        for (name, id) in &self.tenant_name_index {
            match self.created_tenants.get(id) {
                Some(data) if &data.name == name => {}
                _ => return Err(format!("name index entry {name} -> {id} is stale")),
            }
        }
        for (group, data) in &self.tenant_groups {
            if data.tenants.is_empty() {
                return Err(format!("tenant group {group} has no members"));
            }
            for id in &data.tenants {
                let tenant = self
                    .created_tenants
                    .get(id)
                    .ok_or_else(|| format!("group {group} lists unknown tenant {id}"))?;
                if tenant.tenant_group.as_deref() != Some(group.as_str()) {
                    return Err(format!("group {group} lists tenant {id} from another group"));
                }
                if tenant.cluster != data.cluster {
                    return Err(format!("group {group} spans clusters"));
                }
            }
        }
        for (id, data) in &self.created_tenants {
            if self.deleted_tenants.contains(id) {
                return Err(format!("tenant {id} is both live and deleted"));
            }
            let in_cluster = self
                .clusters
                .get(&data.cluster)
                .is_some_and(|c| c.tenants.contains(id));
            if !in_cluster {
                return Err(format!("tenant {id} missing from cluster {}", data.cluster));
            }
        }
        Ok(())
    }
}
