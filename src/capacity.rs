use serde::Deserialize;

/// Growth policy for the per-cluster tenant group capacity knob.
///
/// Capacity only ever increases; a decrease could re-trigger the same
/// capacity errors forever.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CapacityPolicy {
    #[serde(default = "CapacityPolicy::default_growth_factor")]
    pub growth_factor: f64,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            growth_factor: Self::default_growth_factor(),
        }
    }
}

impl CapacityPolicy {
    pub fn default_growth_factor() -> f64 {
        1.2
    }

    /// Initial per-cluster capacity: enough room for half the initial
    /// tenants ungrouped plus every allowed group, spread across clusters.
    pub fn initial_capacity(initial_tenants: u32, max_tenant_groups: u32, clusters: u32) -> u32 {
        if clusters == 0 {
            return 0;
        }
        (initial_tenants / 2 + max_tenant_groups).saturating_sub(1) / clusters
    }
}

/// Compute the next capacity after a capacity-exhausted error.
/// - `current`: the capacity every cluster currently has
/// - `policy`: growth configuration
/// Returns `ceil(current * factor)`, but always at least `current + 1`.
pub fn next_capacity(current: u32, policy: &CapacityPolicy) -> u32 {
    let grown = (current as f64 * policy.growth_factor).ceil();
    let grown = if grown >= u32::MAX as f64 {
        u32::MAX
    } else {
        grown as u32
    };
    grown.max(current.saturating_add(1))
}
