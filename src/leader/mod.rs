// SPDX-License-Identifier: Apache-2.0

//! Leader selection.
//!
//! A [`LeaderSelector`] decides which source's traffic is trusted for
//! group-scoped delivery. The trait is object-safe; the concrete strategy is
//! picked at runtime from [`crate::config::Strategy`], so an operator can
//! choose "accept everyone", "accept one auto-elected source", or "accept
//! only a pinned source" without touching the dispatcher.
//!
//! Lock order throughout this module is triplet record before group record.
//! Failure callbacks are always invoked after every registry guard has been
//! dropped, since a callback may re-enter the registry.

use crate::identity::{InstanceId, LocalIdentity, WILDCARD};
use crate::policy::{FailureCallback, GroupSelect, LeadershipPolicy, NotifyPolicy, RankSelect};
use crate::registry::{GroupRecord, Registry, TripletRecord, TripletState};
use crate::Result;
use std::sync::Arc;

mod lowest_alive;
mod passthrough;
mod pinned;

pub use lowest_alive::{LowestAliveSelector, RESERVED_DAEMON_NAME};
pub use passthrough::PassthroughSelector;
pub use pinned::PinnedSelector;

/// Instantiate the selector named by runtime configuration.
pub fn for_strategy(
    strategy: crate::config::Strategy,
    registry: Registry,
    local: LocalIdentity,
    trigger: u64,
) -> Arc<dyn LeaderSelector> {
    use crate::config::Strategy;
    match strategy {
        Strategy::LowestAlive => Arc::new(LowestAliveSelector::new(registry, local, trigger)),
        Strategy::Passthrough => Arc::new(PassthroughSelector::new(registry, local)),
        Strategy::Pinned => Arc::new(PinnedSelector::new(registry, local, trigger)),
    }
}

/// The four leadership operations plus policy management.
pub trait LeaderSelector: Send + Sync {
    /// Store the policy for a triplet and immediately resolve the leader.
    ///
    /// Returns a bad-parameter error when the strategy cannot honor the
    /// policy (see the strategy docs); this is the only operation in the
    /// subsystem that rejects caller input outright.
    fn set_policy(
        &self,
        rec: &TripletRecord,
        groups: GroupSelect,
        ranks: RankSelect,
        notify: NotifyPolicy,
        failure_cb: Option<FailureCallback>,
    ) -> Result<()>;

    /// Pin the leader to a fixed identity, or revert to policy-driven
    /// resolution on `None`.
    fn set_leader_explicit(&self, rec: &TripletRecord, leader: Option<InstanceId>);

    /// (Re)compute the leader from the stored policy. Never errors; when no
    /// candidate is alive the triplet is left unresolved and retried later.
    fn resolve_leader(&self, rec: &TripletRecord);

    /// Whether a group-channel message from `sender` should be delivered.
    fn is_deliverable(&self, rec: &TripletRecord, sender: InstanceId) -> bool;

    /// Gap-based failure test: over all alive sources of `group`, compute the
    /// max forward gap against the leader's sequence number (`new_seq` is the
    /// just-observed non-leader sequence). A gap beyond the trigger marks the
    /// leader not-alive and returns true. Sources behind the leader are
    /// ignored.
    fn has_leader_failed(&self, group: &GroupRecord, leader_rank: u32, new_seq: u64) -> bool;

    /// Process-failure report from the launch layer. Marks the source dead,
    /// re-resolves when the failed process held the leadership, and fires the
    /// failure callback when the notify policy says so.
    fn on_process_failed(&self, string_id: &str, failed: InstanceId);
}

/// Policy-driven resolution shared by the strategies. Caller holds the
/// triplet guard.
pub(crate) fn resolve_locked(state: &mut TripletState, local: &LocalIdentity) {
    if state.pinned {
        return;
    }
    let launch_part = match state.policy.groups {
        GroupSelect::All => Some(WILDCARD),
        GroupSelect::Launch(id) => Some(id),
        GroupSelect::Local => local.instance().map(|id| id.launch_id),
    };
    let Some(launch_part) = launch_part else {
        // Local selector before the local identity is known.
        state.leader = None;
        state.resolved = false;
        return;
    };
    match state.policy.ranks {
        RankSelect::All => {
            state.leader = Some(InstanceId::new(launch_part, WILDCARD));
            state.resolved = true;
        }
        RankSelect::Rank(rank) => {
            state.leader = Some(InstanceId::new(launch_part, rank));
            state.resolved = true;
        }
        RankSelect::LowestAlive => {
            let hit = eligible_groups(state, launch_part)
                .into_iter()
                .find_map(|group| {
                    let mut g = group.lock();
                    let rank = g.lowest_alive_rank()?;
                    g.leader_rank = Some(rank);
                    Some(InstanceId::new(group.launch_id(), rank))
                });
            match hit {
                Some(leader) => {
                    state.leader = Some(leader);
                    state.resolved = true;
                }
                None => {
                    // Nobody alive: unresolved, retried on the next call.
                    state.leader = None;
                    state.resolved = false;
                }
            }
        }
    }
}

/// Groups eligible under the group selector, in launch-id order.
pub(crate) fn eligible_groups(state: &TripletState, launch_part: u32) -> Vec<Arc<GroupRecord>> {
    if launch_part == WILDCARD {
        state.groups.values().cloned().collect()
    } else {
        state.groups.get(&launch_part).cloned().into_iter().collect()
    }
}

/// Shared gap-based failure detection. Marks the leader's source not-alive
/// when the max forward gap exceeds `trigger`.
pub(crate) fn gap_exceeded(group: &GroupRecord, leader_rank: u32, new_seq: u64, trigger: u64) -> bool {
    let mut g = group.lock();
    let Some(leader_seq) = g.source(leader_rank).and_then(|s| s.last_seq) else {
        // No sequence evidence from the leader yet.
        return false;
    };
    let peers_max = g
        .sources
        .iter()
        .filter(|(rank, s)| **rank != leader_rank && s.alive)
        .filter_map(|(_, s)| s.last_seq)
        .max();
    let max_seq = peers_max.map_or(new_seq, |m| m.max(new_seq));
    if max_seq <= leader_seq {
        return false;
    }
    if max_seq - leader_seq <= trigger {
        return false;
    }
    if let Some(src) = g.get_or_create_source(leader_rank, false) {
        src.alive = false;
    }
    true
}

/// Common process-failure handling: mark dead, optionally re-resolve, and
/// evaluate the notify policy. `reelect` is false for strategies with no
/// automatic re-election. The failure callback, when due, fires only after
/// every registry guard has been dropped.
pub(crate) fn fail_process(
    registry: &Registry,
    local: &LocalIdentity,
    string_id: &str,
    failed: InstanceId,
    reelect: bool,
) {
    let Some(rec) = registry.lookup_by_string_id(string_id) else {
        tracing::debug!(string_id, "failure report for unknown triplet");
        return;
    };
    let deferred: Option<(FailureCallback, Option<InstanceId>)> = {
        let mut state = rec.lock();
        if let Some(group) = state.groups.get(&failed.launch_id) {
            let mut g = group.lock();
            if let Some(src) = g.get_or_create_source(failed.rank, false) {
                src.alive = false;
            }
            if g.leader_rank == Some(failed.rank) {
                g.leader_rank = None;
            }
        }
        let old_leader = state.resolved.then_some(state.leader).flatten();
        let was_leader = old_leader.is_some_and(|l| l.matches(&failed));
        if was_leader {
            if reelect {
                resolve_locked(&mut state, local);
            } else {
                state.resolved = false;
            }
        }
        let notify = match state.notify {
            NotifyPolicy::None => false,
            NotifyPolicy::Any => true,
            NotifyPolicy::LeaderOnly => was_leader,
            NotifyPolicy::EligibleGroup => {
                let launch_part = match state.policy.groups {
                    GroupSelect::All => WILDCARD,
                    GroupSelect::Launch(id) => id,
                    GroupSelect::Local => local
                        .instance()
                        .map(|id| id.launch_id)
                        .unwrap_or(WILDCARD),
                };
                launch_part == WILDCARD || launch_part == failed.launch_id
            }
        };
        if notify {
            state.failure_cb.clone().map(|cb| (cb, old_leader))
        } else {
            None
        }
    };
    if let Some((cb, old_leader)) = deferred {
        tracing::info!(string_id, %failed, "invoking failure callback");
        cb(string_id, failed, old_leader);
    } else {
        tracing::debug!(string_id, %failed, "process failure absorbed without notification");
    }
}

/// Store policy fields under the triplet guard, then resolve.
pub(crate) fn store_policy(
    rec: &TripletRecord,
    local: &LocalIdentity,
    groups: GroupSelect,
    ranks: RankSelect,
    notify: NotifyPolicy,
    failure_cb: Option<FailureCallback>,
) {
    let mut state = rec.lock();
    state.policy = LeadershipPolicy { groups, ranks };
    state.notify = notify;
    state.failure_cb = failure_cb;
    resolve_locked(&mut state, local);
}
