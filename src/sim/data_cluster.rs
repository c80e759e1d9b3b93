use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::{ApiError, ApiResult, DataClusterApi};
use crate::keys::{
    KeyRange, covers_registration, covers_tenant_metadata, tenant_key, tenant_range,
};
use crate::sim::SimEnv;
use crate::tenant_info::TenantInfo;
use crate::types::{
    ClusterName, DataTenantEntry, MetaclusterRegistration, TenantGroupName, TenantId, TenantName,
};

/// Everything a data cluster stores: its registration, tenant map and the
/// tenant-prefixed keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataClusterImage {
    pub registration: Option<MetaclusterRegistration>,
    pub tenants: BTreeMap<TenantId, DataTenantEntry>,
    pub data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl DataClusterImage {
    pub fn id_by_name(&self, name: &str) -> Option<TenantId> {
        self.tenants
            .values()
            .find(|t| t.name == name)
            .map(|t| t.id)
    }

    /// Groups are derived from membership, so an empty group cannot exist.
    pub fn tenant_groups(&self) -> BTreeSet<TenantGroupName> {
        self.tenants
            .values()
            .filter_map(|t| t.tenant_group.clone())
            .collect()
    }

    pub fn tenants_in_group(&self, group: &str) -> BTreeSet<TenantId> {
        self.tenants
            .values()
            .filter(|t| t.tenant_group.as_deref() == Some(group))
            .map(|t| t.id)
            .collect()
    }

    pub(crate) fn insert_tenant(&mut self, entry: DataTenantEntry) {
        self.tenants.insert(entry.id, entry);
    }

    /// Remove a tenant along with every key under its prefix.
    pub(crate) fn remove_tenant(&mut self, id: TenantId) -> Option<DataTenantEntry> {
        let removed = self.tenants.remove(&id)?;
        let range = tenant_range(id);
        self.data.retain(|k, _| !range.contains(k));
        Some(removed)
    }

    fn clear_ranges(&mut self, ranges: &[KeyRange]) {
        self.data.retain(|k, _| !ranges.iter().any(|r| r.contains(k)));
        if covers_tenant_metadata(ranges) {
            self.tenants.clear();
        }
        if covers_registration(ranges) {
            self.registration = None;
        }
    }

    /// The part of this image covered by `ranges`.
    pub(crate) fn restricted_to(&self, ranges: &[KeyRange]) -> DataClusterImage {
        DataClusterImage {
            registration: if covers_registration(ranges) {
                self.registration.clone()
            } else {
                None
            },
            tenants: if covers_tenant_metadata(ranges) {
                self.tenants.clone()
            } else {
                BTreeMap::new()
            },
            data: self
                .data
                .iter()
                .filter(|(k, _)| ranges.iter().any(|r| r.contains(k)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Write `image` over the given ranges of this image.
    pub(crate) fn restore_from(&mut self, image: &DataClusterImage, ranges: &[KeyRange]) {
        self.clear_ranges(ranges);
        let restored = image.restricted_to(ranges);
        if covers_registration(ranges) {
            self.registration = restored.registration;
        }
        if covers_tenant_metadata(ranges) {
            self.tenants = restored.tenants;
        }
        self.data.extend(restored.data);
    }
}

pub struct SimDataCluster {
    name: ClusterName,
    connection_string: String,
    env: Arc<SimEnv>,
    state: Mutex<DataClusterImage>,
}

impl SimDataCluster {
    pub fn new(name: ClusterName, env: Arc<SimEnv>) -> Arc<Self> {
        Arc::new(Self {
            connection_string: format!("sim://{}", name),
            name,
            env,
            state: Mutex::new(DataClusterImage::default()),
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DataClusterImage> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the cluster's current contents.
    pub fn image(&self) -> DataClusterImage {
        self.state().clone()
    }

    fn resolve_key(image: &DataClusterImage, info: &TenantInfo, key: &[u8]) -> ApiResult<Vec<u8>> {
        if !info.is_authorized() {
            return Err(ApiError::PermissionDenied);
        }
        if !info.has_tenant() {
            return Ok(key.to_vec());
        }
        if !image.tenants.contains_key(&info.tenant_id) {
            return Err(ApiError::TenantNotFound);
        }
        Ok(tenant_key(info.tenant_id, key))
    }

    /// Write a key on behalf of the request described by `info`. Tenant
    /// requests are confined to the tenant's prefix.
    pub async fn write(&self, info: &TenantInfo, key: &[u8], value: &[u8]) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        let key = Self::resolve_key(&state, info, key)?;
        state.data.insert(key, value.to_vec());
        Ok(())
    }

    pub async fn read(&self, info: &TenantInfo, key: &[u8]) -> ApiResult<Option<Vec<u8>>> {
        self.env.latency().await;
        let state = self.state();
        let key = Self::resolve_key(&state, info, key)?;
        Ok(state.data.get(&key).cloned())
    }
}

#[async_trait]
impl DataClusterApi for SimDataCluster {
    fn name(&self) -> &ClusterName {
        &self.name
    }

    fn connection_string(&self) -> String {
        self.connection_string.clone()
    }

    async fn list_tenants(&self, limit: usize) -> ApiResult<Vec<(TenantId, DataTenantEntry)>> {
        self.env.latency().await;
        let state = self.state();
        Ok(state
            .tenants
            .iter()
            .take(limit)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect())
    }

    async fn tenant_name_index(&self, limit: usize) -> ApiResult<Vec<(TenantName, TenantId)>> {
        self.env.latency().await;
        let state = self.state();
        let index: BTreeMap<TenantName, TenantId> = state
            .tenants
            .values()
            .map(|t| (t.name.clone(), t.id))
            .collect();
        Ok(index.into_iter().take(limit).collect())
    }

    async fn tenant_groups(&self, limit: usize) -> ApiResult<Vec<TenantGroupName>> {
        self.env.latency().await;
        Ok(self.state().tenant_groups().into_iter().take(limit).collect())
    }

    async fn tenants_in_group(
        &self,
        group: &TenantGroupName,
        limit: usize,
    ) -> ApiResult<BTreeSet<TenantId>> {
        self.env.latency().await;
        Ok(self
            .state()
            .tenants_in_group(group)
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn delete_tenant(&self, name: &TenantName, expected_id: TenantId) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        match state.id_by_name(name) {
            Some(id) if id == expected_id => {
                state.remove_tenant(id);
                Ok(())
            }
            _ => Err(ApiError::TenantNotFound),
        }
    }

    async fn delete_tenants(&self, ids: &BTreeSet<TenantId>) -> ApiResult<()> {
        self.env.latency().await;
        let mut state = self.state();
        for id in ids {
            state.remove_tenant(*id);
        }
        Ok(())
    }

    async fn registration(&self) -> ApiResult<Option<MetaclusterRegistration>> {
        self.env.latency().await;
        Ok(self.state().registration.clone())
    }

    async fn forget_metacluster(&self) -> ApiResult<()> {
        self.env.latency().await;
        self.state().registration = None;
        Ok(())
    }

    async fn clear_ranges(&self, ranges: &[KeyRange]) -> ApiResult<()> {
        self.env.latency().await;
        self.state().clear_ranges(ranges);
        Ok(())
    }
}
