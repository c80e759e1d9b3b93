use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::api::{ApiError, ApiResult, ManagementApi, RestoreFailure, RestoreOptions};
use crate::sim::data_cluster::DataClusterImage;
use crate::sim::{SimDataCluster, SimEnv, SimNetwork};
use crate::types::{
    ClusterName, ClusterType, DataClusterEntry, DataTenantEntry, MetaclusterRegistration,
    TENANT_ID_PREFIX_MAX, TENANT_ID_PREFIX_MIN, TenantGroupEntry, TenantGroupName, TenantId,
    TenantMapEntry, TenantName, TenantState,
};

const TENANT_ID_COUNTER_BITS: u32 = 48;
const TENANT_ID_COUNTER_MASK: i64 = (1 << TENANT_ID_COUNTER_BITS) - 1;

#[derive(Default)]
struct ManagementState {
    registration: Option<MetaclusterRegistration>,
    tenant_id_prefix: i64,
    next_tenant_counter: i64,
    tenants: BTreeMap<TenantId, TenantMapEntry>,
    name_index: BTreeMap<TenantName, TenantId>,
    groups: BTreeMap<TenantGroupName, TenantGroupEntry>,
    clusters: BTreeMap<ClusterName, DataClusterEntry>,
}

impl ManagementState {
    fn metacluster(&self) -> ApiResult<&MetaclusterRegistration> {
        self.registration.as_ref().ok_or(ApiError::MetaclusterNotFound)
    }

    /// Group slots a cluster uses: one per group plus one per ungrouped tenant.
    fn allocation(&self, cluster: &str) -> u32 {
        let groups = self
            .groups
            .values()
            .filter(|g| g.assigned_cluster == cluster)
            .count();
        let ungrouped = self
            .tenants
            .values()
            .filter(|t| t.assigned_cluster == cluster && t.tenant_group.is_none())
            .count();
        (groups + ungrouped) as u32
    }

    fn cluster_entry(&self, name: &str) -> ApiResult<DataClusterEntry> {
        let entry = self.clusters.get(name).ok_or(ApiError::ClusterNotFound)?;
        Ok(DataClusterEntry {
            allocated: self.allocation(name),
            ..entry.clone()
        })
    }

    fn group_members(&self, group: &str) -> BTreeSet<TenantId> {
        self.tenants
            .values()
            .filter(|t| t.tenant_group.as_deref() == Some(group))
            .map(|t| t.id)
            .collect()
    }

    fn allocate_id(&mut self) -> TenantId {
        let id = (self.tenant_id_prefix << TENANT_ID_COUNTER_BITS) | self.next_tenant_counter;
        self.next_tenant_counter += 1;
        id
    }

    /// Keep the id counter ahead of an adopted tenant id.
    fn observe_id(&mut self, id: TenantId) {
        if id >> TENANT_ID_COUNTER_BITS == self.tenant_id_prefix {
            let counter = (id & TENANT_ID_COUNTER_MASK) + 1;
            self.next_tenant_counter = self.next_tenant_counter.max(counter);
        }
    }

    fn insert_tenant(&mut self, entry: TenantMapEntry) {
        if let Some(group) = &entry.tenant_group {
            self.groups
                .entry(group.clone())
                .or_insert_with(|| TenantGroupEntry {
                    assigned_cluster: entry.assigned_cluster.clone(),
                });
        }
        self.name_index.insert(entry.name.clone(), entry.id);
        self.tenants.insert(entry.id, entry);
    }

    /// Remove a tenant and drop its group if it was the last member.
    fn remove_tenant(&mut self, id: TenantId) -> Option<TenantMapEntry> {
        let entry = self.tenants.remove(&id)?;
        if self.name_index.get(&entry.name) == Some(&id) {
            self.name_index.remove(&entry.name);
        }
        if let Some(group) = &entry.tenant_group {
            if self.group_members(group).is_empty() {
                self.groups.remove(group);
            }
        }
        Some(entry)
    }

    fn data_registration(&self, cluster: &ClusterName) -> ApiResult<MetaclusterRegistration> {
        let mgmt = self.metacluster()?;
        Ok(MetaclusterRegistration {
            cluster_type: ClusterType::Data,
            metacluster_name: mgmt.metacluster_name.clone(),
            metacluster_id: mgmt.metacluster_id,
            name: cluster.clone(),
        })
    }
}

/// Simulated management cluster.
pub struct SimManagementCluster {
    env: Arc<SimEnv>,
    network: Arc<SimNetwork>,
    state: Mutex<ManagementState>,
}

impl SimManagementCluster {
    pub fn new(env: Arc<SimEnv>, network: Arc<SimNetwork>) -> Arc<Self> {
        Arc::new(Self {
            env,
            network,
            state: Mutex::new(ManagementState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ManagementState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn data_cluster_for(
        &self,
        state: &ManagementState,
        cluster: &ClusterName,
    ) -> ApiResult<Arc<SimDataCluster>> {
        let entry = state.clusters.get(cluster).ok_or(ApiError::ClusterNotFound)?;
        self.network.resolve(&entry.connection_string)
    }

    /// Push the management directory onto a data cluster restored from
    /// backup. Tenants the data cluster lost are marked `Error`; tenants only
    /// the data cluster knows are removed from it.
    fn restore_applying_management_updates(
        state: &mut ManagementState,
        data: &mut DataClusterImage,
        name: &ClusterName,
        options: RestoreOptions,
    ) -> Result<Vec<String>, RestoreFailure> {
        if !state.clusters.contains_key(name) {
            return Err(ApiError::ClusterNotFound.into());
        }
        let mgmt_id = state.metacluster()?.metacluster_id;
        if let Some(reg) = &data.registration {
            if reg.metacluster_id != mgmt_id && !options.force_join {
                return Err(ApiError::InvalidMetaclusterOperation(format!(
                    "data cluster {name} belongs to a different metacluster"
                ))
                .into());
            }
        }

        let expected: BTreeMap<TenantId, TenantMapEntry> = state
            .tenants
            .values()
            .filter(|t| &t.assigned_cluster == name)
            .map(|t| (t.id, t.clone()))
            .collect();

        let mut messages = Vec::new();
        let stale: Vec<DataTenantEntry> = data
            .tenants
            .values()
            .filter(|t| !expected.contains_key(&t.id))
            .cloned()
            .collect();
        for tenant in &stale {
            messages.push(format!(
                "tenant `{}' ({}) is not in the management cluster and was removed from data cluster `{}'",
                tenant.name, tenant.id, name
            ));
        }
        let missing: Vec<TenantId> = expected
            .keys()
            .filter(|id| !data.tenants.contains_key(*id))
            .copied()
            .collect();
        let missing_messages: BTreeMap<TenantId, String> = missing
            .iter()
            .map(|id| {
                (
                    *id,
                    format!(
                        "tenant `{}' ({}) is missing from data cluster `{}'",
                        expected[id].name, id, name
                    ),
                )
            })
            .collect();
        messages.extend(missing_messages.values().cloned());

        if options.dry_run {
            return Ok(messages);
        }

        for tenant in &stale {
            data.remove_tenant(tenant.id);
        }
        for (id, entry) in &expected {
            if let Some(tenant) = data.tenants.get_mut(id) {
                tenant.name = entry.name.clone();
                tenant.tenant_group = entry.tenant_group.clone();
            }
        }
        for (id, message) in missing_messages {
            if let Some(entry) = state.tenants.get_mut(&id) {
                entry.state = TenantState::Error;
                entry.error = message;
            }
        }
        data.registration = Some(state.data_registration(name)?);
        Ok(messages)
    }

    /// Rebuild the management directory's view of a data cluster from the
    /// cluster's own tenant map. Never modifies the data cluster's tenants.
    fn restore_from_data_cluster(
        state: &mut ManagementState,
        data: &mut DataClusterImage,
        name: &ClusterName,
        connection_string: &str,
        options: RestoreOptions,
        max_tenants: usize,
    ) -> Result<Vec<String>, RestoreFailure> {
        let mgmt_id = state.metacluster()?.metacluster_id;
        if state.clusters.contains_key(name) {
            return Err(ApiError::ClusterAlreadyExists.into());
        }
        if let Some(reg) = &data.registration {
            if reg.metacluster_id != mgmt_id && !options.force_join {
                return Err(ApiError::ClusterAlreadyRegistered.into());
            }
        }
        if data.tenants.len() > max_tenants {
            return Err(ApiError::TooManyTenants(data.tenants.len()).into());
        }

        let mut messages = Vec::new();
        let mut tenant_collision = false;
        for tenant in data.tenants.values() {
            if let Some(existing) = state.name_index.get(&tenant.name) {
                tenant_collision = true;
                messages.push(format!(
                    "tenant `{}' has id {} in data cluster `{}' but id {} in the management cluster",
                    tenant.name, tenant.id, name, existing
                ));
            }
        }
        let mut group_collision = false;
        for group in data.tenant_groups() {
            if let Some(existing) = state.groups.get(&group) {
                group_collision = true;
                messages.push(format!(
                    "tenant group `{}' in data cluster `{}' is already assigned to `{}'",
                    group, name, existing.assigned_cluster
                ));
            }
        }

        let collision = if tenant_collision {
            Some(ApiError::TenantAlreadyExists)
        } else if group_collision {
            Some(ApiError::InvalidTenantConfiguration)
        } else {
            None
        };

        if options.dry_run {
            return match collision {
                Some(error) => Err(RestoreFailure { error, messages }),
                None => Ok(messages),
            };
        }

        // The registration is written before tenants are adopted, so a
        // collision leaves the cluster partially registered.
        state.clusters.insert(
            name.clone(),
            DataClusterEntry {
                connection_string: connection_string.to_string(),
                capacity: 0,
                allocated: 0,
            },
        );
        if let Some(error) = collision {
            return Err(RestoreFailure { error, messages });
        }

        for tenant in data.tenants.values() {
            state.observe_id(tenant.id);
            state.insert_tenant(TenantMapEntry::new(
                tenant.id,
                tenant.name.clone(),
                tenant.tenant_group.clone(),
                name.clone(),
            ));
        }
        let allocated = state.allocation(name);
        if let Some(entry) = state.clusters.get_mut(name) {
            entry.capacity = allocated;
        }
        data.registration = Some(state.data_registration(name)?);
        Ok(messages)
    }
}

#[async_trait]
impl ManagementApi for SimManagementCluster {
    async fn create_metacluster(&self, name: &str, tenant_id_prefix: i64) -> ApiResult<()> {
        self.env.latency().await;
        if !(TENANT_ID_PREFIX_MIN..=TENANT_ID_PREFIX_MAX).contains(&tenant_id_prefix) {
            return Err(ApiError::InvalidMetaclusterOperation(format!(
                "tenant id prefix {tenant_id_prefix} out of range"
            )));
        }
        let mut state = self.state();
        if state.registration.is_some() {
            return Err(ApiError::ClusterAlreadyRegistered);
        }
        let metacluster_id = self.env.random_u64();
        *state = ManagementState {
            registration: Some(MetaclusterRegistration {
                cluster_type: ClusterType::Management,
                metacluster_name: name.to_string(),
                metacluster_id,
                name: name.to_string(),
            }),
            tenant_id_prefix,
            ..ManagementState::default()
        };
        info!(metacluster = name, metacluster_id, tenant_id_prefix, "created metacluster");
        Ok(())
    }

    async fn erase(&self) -> ApiResult<()> {
        self.env.latency().await;
        *self.state() = ManagementState::default();
        Ok(())
    }

    async fn register_cluster(
        &self,
        name: &ClusterName,
        connection_string: &str,
        capacity: u32,
    ) -> ApiResult<()> {
        self.env.latency().await;
        let data_cluster = self.network.resolve(connection_string)?;
        let mut state = self.state();
        let registration = state.data_registration(name)?;
        if state.clusters.contains_key(name) {
            return Err(ApiError::ClusterAlreadyExists);
        }
        let mut data = data_cluster.state();
        if data.registration.is_some() {
            return Err(ApiError::ClusterAlreadyRegistered);
        }
        data.registration = Some(registration);
        state.clusters.insert(
            name.clone(),
            DataClusterEntry {
                connection_string: connection_string.to_string(),
                capacity,
                allocated: 0,
            },
        );
        Ok(())
    }

    async fn remove_cluster(&self, name: &ClusterName) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        state.metacluster()?;
        if state.clusters.remove(name).is_none() {
            return Err(ApiError::ClusterNotFound);
        }
        let ids: Vec<TenantId> = state
            .tenants
            .values()
            .filter(|t| &t.assigned_cluster == name)
            .map(|t| t.id)
            .collect();
        for id in ids {
            state.remove_tenant(id);
        }
        state.groups.retain(|_, g| &g.assigned_cluster != name);
        debug!(cluster = %name, "removed cluster from management directory");
        Ok(())
    }

    async fn get_cluster(&self, name: &ClusterName) -> ApiResult<DataClusterEntry> {
        self.env.latency().await;
        self.state().cluster_entry(name)
    }

    async fn update_cluster_capacities(
        &self,
        names: &[ClusterName],
        capacity: u32,
    ) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        if names.iter().any(|n| !state.clusters.contains_key(n)) {
            return Err(ApiError::ClusterNotFound);
        }
        for name in names {
            if let Some(entry) = state.clusters.get_mut(name) {
                entry.capacity = capacity;
            }
        }
        Ok(())
    }

    async fn restore_cluster(
        &self,
        name: &ClusterName,
        connection_string: &str,
        options: RestoreOptions,
    ) -> Result<Vec<String>, RestoreFailure> {
        self.env.latency().await;
        let data_cluster = self.network.resolve(connection_string)?;
        let mut state = self.state();
        state.metacluster()?;
        let mut data = data_cluster.state();
        if options.apply_management_updates {
            Self::restore_applying_management_updates(&mut state, &mut data, name, options)
        } else {
            Self::restore_from_data_cluster(
                &mut state,
                &mut data,
                name,
                connection_string,
                options,
                self.env.max_tenants_per_cluster(),
            )
        }
    }

    async fn create_tenant(
        &self,
        name: &TenantName,
        tenant_group: Option<&TenantGroupName>,
    ) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        state.metacluster()?;
        if state.name_index.contains_key(name) {
            return Err(ApiError::TenantAlreadyExists);
        }
        let existing_group = tenant_group.and_then(|g| state.groups.get(g));
        let cluster = match existing_group {
            Some(group) => group.assigned_cluster.clone(),
            None => state
                .clusters
                .keys()
                .filter_map(|name| state.cluster_entry(name).ok().map(|entry| (name, entry)))
                .filter(|(_, entry)| entry.has_capacity())
                .min_by_key(|(_, entry)| entry.allocated)
                .map(|(name, _)| name.clone())
                .ok_or(ApiError::MetaclusterNoCapacity)?,
        };
        let data_cluster = self.data_cluster_for(&state, &cluster)?;
        let id = state.allocate_id();
        let entry = TenantMapEntry::new(id, name.clone(), tenant_group.cloned(), cluster);
        data_cluster.state().insert_tenant(DataTenantEntry {
            id,
            name: name.clone(),
            tenant_group: tenant_group.cloned(),
        });
        state.insert_tenant(entry);
        Ok(())
    }

    async fn get_tenant(&self, name: &TenantName) -> ApiResult<TenantMapEntry> {
        self.env.latency().await;
        let state = self.state();
        state
            .name_index
            .get(name)
            .and_then(|id| state.tenants.get(id))
            .cloned()
            .ok_or(ApiError::TenantNotFound)
    }

    async fn delete_tenant(&self, name: &TenantName) -> ApiResult<()> {
        let id = {
            let state = self.state();
            *state.name_index.get(name).ok_or(ApiError::TenantNotFound)?
        };
        self.delete_tenant_by_id(id).await
    }

    async fn delete_tenant_by_id(&self, id: TenantId) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        let cluster = state
            .tenants
            .get(&id)
            .map(|t| t.assigned_cluster.clone())
            .ok_or(ApiError::TenantNotFound)?;
        if let Ok(data_cluster) = self.data_cluster_for(&state, &cluster) {
            data_cluster.state().remove_tenant(id);
        }
        state.remove_tenant(id);
        Ok(())
    }

    async fn configure_tenant_group(
        &self,
        name: &TenantName,
        tenant_group: Option<&TenantGroupName>,
    ) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        let id = *state.name_index.get(name).ok_or(ApiError::TenantNotFound)?;
        let entry = state.tenants.get(&id).cloned().ok_or(ApiError::TenantNotFound)?;
        if entry.tenant_group.as_ref() == tenant_group {
            return Ok(());
        }
        let cluster = entry.assigned_cluster.clone();
        if let Some(group) = tenant_group.and_then(|g| state.groups.get(g)) {
            if group.assigned_cluster != cluster {
                return Err(ApiError::InvalidTenantConfiguration);
            }
        }

        let frees_slot = match &entry.tenant_group {
            Some(old) => state.group_members(old).len() == 1,
            None => true,
        };
        let takes_slot = match tenant_group {
            Some(new) => !state.groups.contains_key(new),
            None => true,
        };
        if takes_slot && !frees_slot {
            let capacity = state.cluster_entry(&cluster)?;
            if capacity.allocated + 1 > capacity.capacity {
                return Err(ApiError::ClusterNoCapacity);
            }
        }

        let data_cluster = self.data_cluster_for(&state, &cluster)?;
        if let Some(tenant) = data_cluster.state().tenants.get_mut(&id) {
            tenant.tenant_group = tenant_group.cloned();
        }
        state.remove_tenant(id);
        state.insert_tenant(TenantMapEntry {
            tenant_group: tenant_group.cloned(),
            ..entry
        });
        Ok(())
    }

    async fn rename_tenant(&self, old: &TenantName, new: &TenantName) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        let id = *state.name_index.get(old).ok_or(ApiError::TenantNotFound)?;
        if state.name_index.contains_key(new) {
            return Err(ApiError::TenantAlreadyExists);
        }
        let cluster = state
            .tenants
            .get(&id)
            .map(|t| t.assigned_cluster.clone())
            .ok_or(ApiError::TenantNotFound)?;
        let data_cluster = self.data_cluster_for(&state, &cluster)?;
        if let Some(tenant) = data_cluster.state().tenants.get_mut(&id) {
            tenant.name = new.clone();
        }
        state.name_index.remove(old);
        state.name_index.insert(new.clone(), id);
        if let Some(entry) = state.tenants.get_mut(&id) {
            entry.name = new.clone();
        }
        Ok(())
    }

    async fn list_tenants(&self, limit: usize) -> ApiResult<Vec<(TenantId, TenantMapEntry)>> {
        self.env.latency().await;
        Ok(self
            .state()
            .tenants
            .iter()
            .take(limit)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect())
    }

    async fn tenant_name_index(&self, limit: usize) -> ApiResult<Vec<(TenantName, TenantId)>> {
        self.env.latency().await;
        Ok(self
            .state()
            .name_index
            .iter()
            .take(limit)
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    async fn tenant_groups(
        &self,
        limit: usize,
    ) -> ApiResult<Vec<(TenantGroupName, TenantGroupEntry)>> {
        self.env.latency().await;
        Ok(self
            .state()
            .groups
            .iter()
            .take(limit)
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect())
    }

    async fn tenants_in_group(
        &self,
        group: &TenantGroupName,
        limit: usize,
    ) -> ApiResult<BTreeSet<TenantId>> {
        self.env.latency().await;
        Ok(self
            .state()
            .group_members(group)
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn registration(&self) -> ApiResult<Option<MetaclusterRegistration>> {
        self.env.latency().await;
        Ok(self.state().registration.clone())
    }
}
