//! Random tenant operations against the live metacluster.
//!
//! Each operation picks its targets from the reference model, issues one
//! management call and records the outcome in the model only after that call
//! committed. Operations that find nothing suitable to act on are no-ops.

use rand::Rng;
use tracing::{debug, info};

use crate::api::{ApiError, ErrorClass};
use crate::capacity::next_capacity;
use crate::orchestrator::RecoveryError;
use crate::types::AccessTime;
use crate::workload::RecoveryContext;

/// What a single generated operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub created: u64,
    pub deleted: u64,
    pub configured: u64,
    pub renamed: u64,
    pub skipped: u64,
}

impl OperationStats {
    fn record(&mut self, kind: usize, outcome: OpOutcome) {
        if outcome == OpOutcome::Skipped {
            self.skipped += 1;
            return;
        }
        match kind {
            0 => self.created += 1,
            1 => self.deleted += 1,
            2 => self.configured += 1,
            _ => self.renamed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.deleted + self.configured + self.renamed + self.skipped
    }
}

/// Grow every data cluster's tenant group capacity after a capacity error.
pub async fn increase_capacity(ctx: &RecoveryContext) -> Result<(), RecoveryError> {
    let current = ctx.tenant_group_capacity();
    let capacity = ctx.raise_tenant_group_capacity(next_capacity(current, &ctx.config.capacity));
    let clusters = ctx.directory().names().to_vec();
    ctx.management
        .update_cluster_capacities(&clusters, capacity)
        .await?;
    debug!(from = current, to = capacity, "increased tenant group capacity");
    Ok(())
}

fn retry_on_capacity(e: &ApiError) -> bool {
    e.class() == ErrorClass::Capacity
}

pub async fn create_tenant(
    ctx: &RecoveryContext,
    access_time: AccessTime,
) -> Result<OpOutcome, RecoveryError> {
    let attempts = ctx.config.name_attempts;
    let Some(name) = ctx.with_model_rng(|model, rng| model.choose_unused_tenant_name(rng, attempts))
    else {
        return Ok(OpOutcome::Skipped);
    };

    loop {
        let group = ctx.with_model_rng(|model, rng| model.choose_tenant_group(rng, None));
        match ctx.management.create_tenant(&name, group.as_ref()).await {
            Ok(()) => break,
            Err(e) if retry_on_capacity(&e) => increase_capacity(ctx).await?,
            Err(e) => return Err(e.into()),
        }
    }

    let entry = ctx.management.get_tenant(&name).await?;
    debug!(tenant = %name, tenant_id = entry.id, cluster = %entry.assigned_cluster, %access_time, "created tenant");
    ctx.model().record_create(&entry, access_time);
    Ok(OpOutcome::Applied)
}

pub async fn delete_tenant(
    ctx: &RecoveryContext,
    access_time: AccessTime,
) -> Result<OpOutcome, RecoveryError> {
    let attempts = ctx.config.name_attempts;
    let Some((name, id)) =
        ctx.with_model_rng(|model, rng| model.choose_existing_tenant(rng, attempts))
    else {
        return Ok(OpOutcome::Skipped);
    };

    debug!(tenant = %name, tenant_id = id, %access_time, "deleting tenant");
    ctx.management.delete_tenant(&name).await?;
    ctx.model().record_delete(id);
    Ok(OpOutcome::Applied)
}

pub async fn configure_tenant(
    ctx: &RecoveryContext,
    access_time: AccessTime,
) -> Result<OpOutcome, RecoveryError> {
    let attempts = ctx.config.name_attempts;
    let picked = ctx.with_model_rng(|model, rng| {
        let (name, id) = model.choose_existing_tenant(rng, attempts)?;
        let cluster = model.tenant(id)?.cluster.clone();
        let group = model.choose_tenant_group(rng, Some(&cluster));
        Some((name, id, group))
    });
    let Some((name, id, group)) = picked else {
        return Ok(OpOutcome::Skipped);
    };

    loop {
        match ctx
            .management
            .configure_tenant_group(&name, group.as_ref())
            .await
        {
            Ok(()) => break,
            Err(e) if retry_on_capacity(&e) => increase_capacity(ctx).await?,
            Err(e) => return Err(e.into()),
        }
    }

    debug!(tenant = %name, tenant_id = id, group = ?group, %access_time, "configured tenant");
    ctx.model().record_configure(id, group.as_ref(), access_time);
    Ok(OpOutcome::Applied)
}

pub async fn rename_tenant(
    ctx: &RecoveryContext,
    access_time: AccessTime,
) -> Result<OpOutcome, RecoveryError> {
    let attempts = ctx.config.name_attempts;
    let picked = ctx.with_model_rng(|model, rng| {
        let old = model.choose_existing_tenant(rng, attempts);
        let new = model.choose_unused_tenant_name(rng, attempts);
        old.zip(new)
    });
    let Some(((old_name, id), new_name)) = picked else {
        return Ok(OpOutcome::Skipped);
    };

    debug!(old = %old_name, new = %new_name, tenant_id = id, %access_time, "renaming tenant");
    ctx.management.rename_tenant(&old_name, &new_name).await?;
    ctx.model().record_rename(id, &new_name, access_time);
    Ok(OpOutcome::Applied)
}

/// Issue random operations until the deadline passes. The deadline is only
/// consulted between operations, so none is ever left half-recorded.
pub async fn run_operations(ctx: &RecoveryContext) -> Result<OperationStats, RecoveryError> {
    let mut stats = OperationStats::default();
    while !ctx.deadline_passed() {
        let kind = ctx.rng().random_range(0..4);
        let access_time = ctx.access_time();
        let outcome = match kind {
            0 => create_tenant(ctx, access_time).await?,
            1 => delete_tenant(ctx, access_time).await?,
            2 => configure_tenant(ctx, access_time).await?,
            _ => rename_tenant(ctx, access_time).await?,
        };
        stats.record(kind, outcome);
    }
    info!(
        created = stats.created,
        deleted = stats.deleted,
        configured = stats.configured,
        renamed = stats.renamed,
        skipped = stats.skipped,
        total = stats.total(),
        "operations complete"
    );
    Ok(stats)
}
