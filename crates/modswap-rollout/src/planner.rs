//! Wave planning.
//!
//! Canary waves grow by percentage: wave *k* targets
//! `ceil(fleet_size * pct_k / 100)` nodes in total, where
//! `pct_k = min(initial + (k - 1) * increment, 100)`. Steps that would
//! not add a node are skipped, so every planned wave deploys at least one
//! node and the last wave always reaches the full fleet.

/// One planned canary wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavePlan {
    /// Percentage of the fleet this wave brings the deployment to.
    pub percentage: u32,
    /// Cumulative number of nodes deployed once this wave completes.
    pub target_count: usize,
}

/// `ceil(fleet_size * percentage / 100)`, clamped to the fleet.
pub fn target_count(fleet_size: usize, percentage: u32) -> usize {
    let raw = (fleet_size as u64 * u64::from(percentage)).div_ceil(100);
    (raw as usize).min(fleet_size)
}

/// Plan every canary wave for a fleet.
pub fn plan_waves(fleet_size: usize, initial_percentage: u32, increment: u32) -> Vec<WavePlan> {
    let mut plan = Vec::new();
    if fleet_size == 0 {
        return plan;
    }

    let mut pct = initial_percentage.clamp(1, 100);
    let mut last = 0;
    loop {
        let target = target_count(fleet_size, pct);
        if target > last {
            plan.push(WavePlan {
                percentage: pct,
                target_count: target,
            });
            last = target;
        }
        if target >= fleet_size {
            break;
        }
        pct = if increment == 0 {
            100
        } else {
            pct.saturating_add(increment).min(100)
        };
    }
    plan
}
