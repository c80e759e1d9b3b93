use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::api::{ApiError, ApiResult, BackupAgent, BackupTag, DataClusterApi};
use crate::keys::KeyRange;
use crate::sim::{DataClusterImage, SimEnv, SimNetwork};

struct RunningBackup {
    connection_string: String,
    container_url: String,
    ranges: Vec<KeyRange>,
    done_at: Instant,
    /// Filled in once the backup reaches its snapshot instant.
    image: Option<DataClusterImage>,
}

#[derive(Default)]
struct BackupState {
    running: BTreeMap<String, RunningBackup>,
    containers: BTreeMap<String, DataClusterImage>,
}

/// Simulated backup agent. A backup snapshots its cluster at a random
/// instant between submission and completion, so writes made while it runs
/// may or may not be captured.
pub struct SimBackupAgent {
    env: Arc<SimEnv>,
    network: Arc<SimNetwork>,
    state: Arc<Mutex<BackupState>>,
}

fn lock(state: &Mutex<BackupState>) -> MutexGuard<'_, BackupState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn snapshot(
    network: &SimNetwork,
    connection_string: &str,
    ranges: &[KeyRange],
) -> ApiResult<DataClusterImage> {
    Ok(network.resolve(connection_string)?.image().restricted_to(ranges))
}

impl SimBackupAgent {
    pub fn new(env: Arc<SimEnv>, network: Arc<SimNetwork>) -> Arc<Self> {
        Arc::new(Self {
            env,
            network,
            state: Arc::new(Mutex::new(BackupState::default())),
        })
    }

    fn state(&self) -> MutexGuard<'_, BackupState> {
        lock(&self.state)
    }

    /// Whether the running backup `tag` has already captured its snapshot.
    pub fn snapshot_taken(&self, tag: &BackupTag) -> bool {
        self.state()
            .running
            .get(&tag.0)
            .is_some_and(|b| b.image.is_some())
    }

    /// Image stored in a completed backup container.
    pub fn container(&self, container_url: &str) -> Option<DataClusterImage> {
        self.state().containers.get(container_url).cloned()
    }
}

#[async_trait]
impl BackupAgent for SimBackupAgent {
    async fn submit_backup(
        &self,
        cluster: &Arc<dyn DataClusterApi>,
        container_url: &str,
        tag: &BackupTag,
        ranges: &[KeyRange],
    ) -> ApiResult<()> {
        self.env.latency().await;
        let (snapshot_after, duration) = self.env.backup_window();
        let now = Instant::now();
        let snapshot_at = now + snapshot_after;
        {
            let mut state = self.state();
            if state.running.contains_key(&tag.0) {
                return Err(ApiError::BackupDuplicate);
            }
            debug!(cluster = %cluster.name(), tag = %tag.0, "backup submitted");
            state.running.insert(
                tag.0.clone(),
                RunningBackup {
                    connection_string: cluster.connection_string(),
                    container_url: container_url.to_string(),
                    ranges: ranges.to_vec(),
                    done_at: now + duration,
                    image: None,
                },
            );
        }

        let shared = self.state.clone();
        let network = self.network.clone();
        let tag = tag.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(snapshot_at).await;
            let mut state = lock(&shared);
            let Some(backup) = state.running.get_mut(&tag.0) else {
                return;
            };
            if backup.image.is_none() {
                match snapshot(&network, &backup.connection_string, &backup.ranges) {
                    Ok(image) => backup.image = Some(image),
                    Err(e) => debug!(tag = %tag.0, error = %e, "backup snapshot deferred"),
                }
            }
        });
        Ok(())
    }

    async fn wait_backup(
        &self,
        _cluster: &Arc<dyn DataClusterApi>,
        tag: &BackupTag,
    ) -> ApiResult<String> {
        let done_at = self
            .state()
            .running
            .get(&tag.0)
            .map(|b| b.done_at)
            .ok_or_else(|| ApiError::BackupNotFound(tag.0.clone()))?;
        tokio::time::sleep_until(done_at).await;

        let backup = self
            .state()
            .running
            .remove(&tag.0)
            .ok_or_else(|| ApiError::BackupNotFound(tag.0.clone()))?;
        let image = match backup.image {
            Some(image) => image,
            None => snapshot(&self.network, &backup.connection_string, &backup.ranges)?,
        };
        self.state()
            .containers
            .insert(backup.container_url.clone(), image);
        Ok(backup.container_url)
    }

    async fn restore(
        &self,
        cluster: &Arc<dyn DataClusterApi>,
        _tag: &BackupTag,
        container_url: &str,
        ranges: &[KeyRange],
    ) -> ApiResult<()> {
        self.env.latency().await;
        let image = self
            .container(container_url)
            .ok_or_else(|| ApiError::BackupNotFound(container_url.to_string()))?;
        let target = self.network.resolve(&cluster.connection_string())?;
        target.state().restore_from(&image, ranges);
        Ok(())
    }
}
