//! Node pool decision primitives.
//!
//! This library holds the pure part of the node pool control loop: given the
//! configured targets of one scene and what is currently tracked for it,
//! decide the single topology change (if any) the next pass should make.
//!
//! - **Targets**: `min`/`max`/`idle` node counts configured per scene.
//! - **Counts**: total tracked nodes and the idle (undistributed) subset.
//! - **Action**: create one node, or destroy a number of idle nodes.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - At most one action is produced per scene per pass
//! - Destroy actions only ever select idle nodes, never distributed ones

use std::collections::BTreeMap;
use std::time::Duration;

/// Desired pool shape for one scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolTargets {
    /// Nodes that must exist regardless of demand.
    pub min_nodes: u32,

    /// Hard ceiling on tracked nodes.
    pub max_nodes: u32,

    /// Undistributed nodes to keep warm.
    pub idle_nodes: u32,
}

/// Observed pool shape for one scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    /// All tracked nodes of the scene.
    pub total: usize,

    /// Tracked nodes not yet handed to a caller.
    pub idle: usize,
}

impl PoolCounts {
    pub fn new(total: usize, idle: usize) -> Self {
        Self { total, idle }
    }
}

/// Why a node is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateReason {
    /// Fewer nodes than `min_nodes`.
    BelowMinimum,

    /// Fewer idle nodes than `idle_nodes` and room below `max_nodes`.
    IdleDeficit,
}

/// Why idle nodes are being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// More nodes than `max_nodes`.
    AboveMaximum,

    /// More idle nodes than `idle_nodes`.
    IdleSurplus,
}

/// A topology change for one scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    /// Create exactly one node.
    Create(CreateReason),

    /// Destroy `count` nodes taken from the tail of the idle subset.
    Destroy { count: usize, reason: DestroyReason },
}

impl PoolAction {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create(CreateReason::BelowMinimum) => "create_below_minimum",
            Self::Create(CreateReason::IdleDeficit) => "create_idle_deficit",
            Self::Destroy {
                reason: DestroyReason::AboveMaximum,
                ..
            } => "destroy_above_maximum",
            Self::Destroy {
                reason: DestroyReason::IdleSurplus,
                ..
            } => "destroy_idle_surplus",
        }
    }
}

/// Decide the action for one scene.
///
/// Rules are evaluated in order and the first match wins:
///
/// 1. `total < min` → create
/// 2. `idle < idle_target && total < max` → create
/// 3. `total > max` → destroy `min(total - max, idle)`
/// 4. `idle > idle_target` → destroy `idle - idle_target`
///
/// Returns `None` when the scene needs nothing, including the case where the
/// scene is above its maximum but has no idle node left to reclaim.
pub fn plan_scene(targets: &PoolTargets, counts: PoolCounts) -> Option<PoolAction> {
    let min = targets.min_nodes as usize;
    let max = targets.max_nodes as usize;
    let idle_target = targets.idle_nodes as usize;

    if counts.total < min {
        return Some(PoolAction::Create(CreateReason::BelowMinimum));
    }

    if counts.idle < idle_target && counts.total < max {
        return Some(PoolAction::Create(CreateReason::IdleDeficit));
    }

    if counts.total > max {
        let count = (counts.total - max).min(counts.idle);
        if count == 0 {
            return None;
        }
        return Some(PoolAction::Destroy {
            count,
            reason: DestroyReason::AboveMaximum,
        });
    }

    if counts.idle > idle_target {
        return Some(PoolAction::Destroy {
            count: counts.idle - idle_target,
            reason: DestroyReason::IdleSurplus,
        });
    }

    None
}

/// Take the last `count` items, keeping their relative order.
///
/// No recency or fairness ordering is applied beyond list position.
pub fn select_tail<T>(mut items: Vec<T>, count: usize) -> Vec<T> {
    let keep = items.len().saturating_sub(count);
    items.split_off(keep)
}

/// Group items by key, preserving the input order inside every group.
pub fn group_by<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> BTreeMap<K, Vec<T>>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }
    groups
}

/// Default period of the demand poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Default debounce window for registry change notifications.
pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_millis(1500);
