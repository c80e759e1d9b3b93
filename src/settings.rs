use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::capacity::CapacityPolicy;

/// Upper bound (exclusive) on the tenant namespace, `tenant%08d`.
pub const TENANT_NAMESPACE_LIMIT: u32 = 100_000_000;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkloadConfig {
    #[serde(default = "default_max_tenants")]
    pub max_tenants: u32,
    #[serde(default = "default_initial_tenants")]
    pub initial_tenants: u32,
    #[serde(default = "default_max_tenant_groups")]
    pub max_tenant_groups: u32,
    /// How long operations keep running once every backup completed.
    #[serde(default = "default_post_backup_ops_secs")]
    pub post_backup_ops_secs: f64,
    /// Chance that any given data cluster is backed up and restored.
    #[serde(default = "default_backup_probability")]
    pub backup_probability: f64,
    /// Resampling attempts when choosing a tenant name.
    #[serde(default = "default_name_attempts")]
    pub name_attempts: u32,
    #[serde(default)]
    pub capacity: CapacityPolicy,
    /// Pin the recovery mode instead of drawing it at random.
    #[serde(default)]
    pub recovery_mode: Option<RecoveryModeSetting>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            max_tenants: default_max_tenants(),
            initial_tenants: default_initial_tenants(),
            max_tenant_groups: default_max_tenant_groups(),
            post_backup_ops_secs: default_post_backup_ops_secs(),
            backup_probability: default_backup_probability(),
            name_attempts: default_name_attempts(),
            capacity: CapacityPolicy::default(),
            recovery_mode: None,
        }
    }
}

/// Configuration values that cannot be normalized into range.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("workload.post_backup_ops_secs must be a finite, non-negative number of seconds (got {0})")]
    InvalidPostBackupOps(f64),
    #[error("workload.backup_probability must be a number (got {0})")]
    InvalidBackupProbability(f64),
    #[error("sim.data_clusters must be at least 1")]
    NoDataClusters,
    #[error("{0} bounds must be ordered as [min, max]")]
    UnorderedBounds(&'static str),
}

impl WorkloadConfig {
    /// Reject values `normalized` cannot clamp.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secs = self.post_backup_ops_secs;
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::InvalidPostBackupOps(secs));
        }
        if self.backup_probability.is_nan() {
            return Err(ConfigError::InvalidBackupProbability(self.backup_probability));
        }
        Ok(())
    }

    /// Apply the bounds the workload relies on: the namespace fits in eight
    /// digits, initial tenants never exceed the namespace and groups stay
    /// within twice the tenant count.
    pub fn normalized(mut self) -> Self {
        self.max_tenants = self.max_tenants.clamp(1, TENANT_NAMESPACE_LIMIT - 1);
        self.initial_tenants = self.initial_tenants.min(self.max_tenants);
        self.max_tenant_groups = self.max_tenant_groups.min(2 * self.max_tenants);
        self.name_attempts = self.name_attempts.max(1);
        self.backup_probability = self.backup_probability.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryModeSetting {
    Management,
    Data,
    Both,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimConfig {
    #[serde(default = "default_data_clusters")]
    pub data_clusters: u32,
    /// Inclusive bounds on simulated per-operation latency.
    #[serde(default = "default_op_latency_ms")]
    pub op_latency_ms: (u64, u64),
    /// Inclusive bounds on how long a backup takes to complete.
    #[serde(default = "default_backup_duration_ms")]
    pub backup_duration_ms: (u64, u64),
    #[serde(default = "default_max_tenants_per_cluster")]
    pub max_tenants_per_cluster: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            data_clusters: default_data_clusters(),
            op_latency_ms: default_op_latency_ms(),
            backup_duration_ms: default_backup_duration_ms(),
            max_tenants_per_cluster: default_max_tenants_per_cluster(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_max_tenants() -> u32 {
    1000
}

fn default_initial_tenants() -> u32 {
    40
}

fn default_max_tenant_groups() -> u32 {
    20
}

fn default_post_backup_ops_secs() -> f64 {
    30.0
}

fn default_backup_probability() -> f64 {
    0.1
}

fn default_name_attempts() -> u32 {
    10
}

fn default_data_clusters() -> u32 {
    4
}

fn default_op_latency_ms() -> (u64, u64) {
    (1, 20)
}

fn default_backup_duration_ms() -> (u64, u64) {
    (200, 3000)
}

fn default_max_tenants_per_cluster() -> usize {
    10_000
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                toml::from_str::<Self>(&data)?
            }
            None => Self::default(),
        };
        cfg.workload.validate()?;
        cfg.workload = cfg.workload.normalized();
        if cfg.sim.data_clusters == 0 {
            return Err(ConfigError::NoDataClusters.into());
        }
        if cfg.sim.op_latency_ms.0 > cfg.sim.op_latency_ms.1 {
            return Err(ConfigError::UnorderedBounds("sim.op_latency_ms").into());
        }
        if cfg.sim.backup_duration_ms.0 > cfg.sim.backup_duration_ms.1 {
            return Err(ConfigError::UnorderedBounds("sim.backup_duration_ms").into());
        }
        Ok(cfg)
    }
}
