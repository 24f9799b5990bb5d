// SPDX-License-Identifier: Apache-2.0

//! Explicit-required strategy: the leader must be pinned through
//! [`LeaderSelector::set_leader_explicit`]. There is no automatic
//! re-election; when the pinned leader fails the triplet goes unresolved and
//! group delivery stops until a new leader is pinned.

use super::{fail_process, gap_exceeded, LeaderSelector};
use crate::identity::{InstanceId, LocalIdentity};
use crate::policy::{FailureCallback, GroupSelect, LeadershipPolicy, NotifyPolicy, RankSelect};
use crate::registry::{GroupRecord, Registry, TripletRecord};
use crate::Result;

pub struct PinnedSelector {
    registry: Registry,
    local: LocalIdentity,
    trigger: u64,
}

impl PinnedSelector {
    pub fn new(registry: Registry, local: LocalIdentity, trigger: u64) -> Self {
        Self {
            registry,
            local,
            trigger,
        }
    }
}

impl LeaderSelector for PinnedSelector {
    fn set_policy(
        &self,
        rec: &TripletRecord,
        groups: GroupSelect,
        ranks: RankSelect,
        notify: NotifyPolicy,
        failure_cb: Option<FailureCallback>,
    ) -> Result<()> {
        // Without automatic re-election the caller has no way to learn the
        // leader is gone except through the callback, so demand one whenever
        // no leader is pinned yet.
        let pinned = rec.lock().pinned;
        if !pinned && failure_cb.is_none() {
            crate::raise!(
                "explicit-required strategy for {} needs a pinned leader or a failure callback",
                rec.id()
            );
        }
        if notify != NotifyPolicy::None && failure_cb.is_none() {
            crate::raise!(
                "notify policy {notify:?} for {} requires a failure callback",
                rec.id()
            );
        }
        let mut state = rec.lock();
        state.policy = LeadershipPolicy { groups, ranks };
        state.notify = notify;
        state.failure_cb = failure_cb;
        Ok(())
    }

    fn set_leader_explicit(&self, rec: &TripletRecord, leader: Option<InstanceId>) {
        let mut state = rec.lock();
        match leader {
            Some(id) => {
                state.leader = Some(id);
                state.resolved = true;
                state.pinned = true;
            }
            None => {
                state.pinned = false;
                state.leader = None;
                state.resolved = false;
            }
        }
    }

    fn resolve_leader(&self, rec: &TripletRecord) {
        // Resolution only ever happens through an explicit pin.
        let state = rec.lock();
        if !state.pinned {
            tracing::debug!(id = rec.id(), "no pinned leader; leaving unresolved");
        }
    }

    fn is_deliverable(&self, rec: &TripletRecord, sender: InstanceId) -> bool {
        let state = rec.lock();
        state.resolved && state.leader.is_some_and(|l| l.matches(&sender))
    }

    fn has_leader_failed(&self, group: &GroupRecord, leader_rank: u32, new_seq: u64) -> bool {
        gap_exceeded(group, leader_rank, new_seq, self.trigger)
    }

    fn on_process_failed(&self, string_id: &str, failed: InstanceId) {
        // Drop the pin when the pinned leader is the one that failed.
        if let Some(rec) = self.registry.lookup_by_string_id(string_id) {
            let mut state = rec.lock();
            if state.pinned && state.leader.is_some_and(|l| l.matches(&failed)) {
                state.pinned = false;
            }
        }
        fail_process(&self.registry, &self.local, string_id, failed, false);
    }
}
