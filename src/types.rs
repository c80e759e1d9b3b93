//! Core identifiers and directory records shared by the model, the
//! collaborator traits and the simulator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A process-unique tenant identifier. Assigned once by the management
/// cluster and never reused.
pub type TenantId = i64;

/// Mutable, metacluster-unique tenant name.
pub type TenantName = String;

/// Tenant group name.
pub type TenantGroupName = String;

/// Data cluster name, e.g. `cluster_00000003`.
pub type ClusterName = String;

/// Sentinel for "no tenant" in request metadata.
pub const INVALID_TENANT: TenantId = -1;

/// Lowest and highest tenant id prefix a metacluster may be created with.
pub const TENANT_ID_PREFIX_MIN: i64 = 0;
pub const TENANT_ID_PREFIX_MAX: i64 = 32767;

/// When, relative to the backup window, a tenant was last touched by an
/// operation of a given kind.
///
/// Ordering matters: checks compare with `<=` against `BeforeBackup`, and
/// `None` sorts below every real access time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessTime {
    None,
    BeforeBackup,
    DuringBackup,
    AfterBackup,
}

impl fmt::Display for AccessTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessTime::None => write!(f, "None"),
            AccessTime::BeforeBackup => write!(f, "BeforeBackup"),
            AccessTime::DuringBackup => write!(f, "DuringBackup"),
            AccessTime::AfterBackup => write!(f, "AfterBackup"),
        }
    }
}

/// Lifecycle state of a tenant entry in the management directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TenantState {
    Ready,
    /// The entry exists in the management directory but its data cluster
    /// lost it (typically after a restore from an older backup).
    Error,
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantState::Ready => write!(f, "ready"),
            TenantState::Error => write!(f, "error"),
        }
    }
}

/// A management directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMapEntry {
    pub id: TenantId,
    pub name: TenantName,
    pub tenant_group: Option<TenantGroupName>,
    pub assigned_cluster: ClusterName,
    pub state: TenantState,
    /// Error detail, only populated in `TenantState::Error`.
    pub error: String,
}

impl TenantMapEntry {
    pub fn new(
        id: TenantId,
        name: impl Into<TenantName>,
        tenant_group: Option<TenantGroupName>,
        assigned_cluster: impl Into<ClusterName>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            tenant_group,
            assigned_cluster: assigned_cluster.into(),
            state: TenantState::Ready,
            error: String::new(),
        }
    }
}

/// A data cluster directory entry. Data clusters do not track assignment or
/// state; they only know which tenants live on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTenantEntry {
    pub id: TenantId,
    pub name: TenantName,
    pub tenant_group: Option<TenantGroupName>,
}

/// Group record in the management directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantGroupEntry {
    pub assigned_cluster: ClusterName,
}

/// Role a cluster plays in its metacluster registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterType {
    Management,
    Data,
}

/// The registration record a cluster stores about the metacluster it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaclusterRegistration {
    pub cluster_type: ClusterType,
    pub metacluster_name: String,
    /// Identity of the metacluster incarnation; a rebuilt management
    /// cluster gets a new one.
    pub metacluster_id: u64,
    pub name: String,
}

/// Management-side metadata for a registered data cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataClusterEntry {
    pub connection_string: String,
    /// Maximum number of tenant groups (ungrouped tenants count as one each).
    pub capacity: u32,
    pub allocated: u32,
}

impl DataClusterEntry {
    pub fn has_capacity(&self) -> bool {
        self.allocated < self.capacity
    }
}
