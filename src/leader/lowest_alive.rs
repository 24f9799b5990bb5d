// SPDX-License-Identifier: Apache-2.0

//! Default strategy: policy-driven resolution with auto-lowest-alive
//! election.
//!
//! One reserved triplet — the management daemon, application name
//! [`RESERVED_DAEMON_NAME`] — always resolves to "anyone" regardless of its
//! configured policy, so daemon traffic is never filtered out while a group
//! is between leaders.

use super::{fail_process, gap_exceeded, resolve_locked, store_policy, LeaderSelector};
use crate::identity::{InstanceId, LocalIdentity};
use crate::policy::{FailureCallback, GroupSelect, NotifyPolicy, RankSelect};
use crate::registry::{GroupRecord, Registry, TripletRecord};
use crate::Result;

/// Application name whose traffic is always deliverable.
pub const RESERVED_DAEMON_NAME: &str = "groupcastd";

pub struct LowestAliveSelector {
    registry: Registry,
    local: LocalIdentity,
    /// Max forward sequence gap tolerated before the leader is declared dead.
    trigger: u64,
}

impl LowestAliveSelector {
    pub fn new(registry: Registry, local: LocalIdentity, trigger: u64) -> Self {
        Self {
            registry,
            local,
            trigger,
        }
    }

    fn is_reserved(rec: &TripletRecord) -> bool {
        rec.triplet().name.as_deref() == Some(RESERVED_DAEMON_NAME)
    }
}

impl LeaderSelector for LowestAliveSelector {
    fn set_policy(
        &self,
        rec: &TripletRecord,
        groups: GroupSelect,
        ranks: RankSelect,
        notify: NotifyPolicy,
        failure_cb: Option<FailureCallback>,
    ) -> Result<()> {
        if notify != NotifyPolicy::None && failure_cb.is_none() {
            crate::raise!(
                "notify policy {notify:?} for {} requires a failure callback",
                rec.id()
            );
        }
        store_policy(rec, &self.local, groups, ranks, notify, failure_cb);
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
                resolve_locked(&mut state, &self.local);
            }
        }
    }

    fn resolve_leader(&self, rec: &TripletRecord) {
        if Self::is_reserved(rec) {
            let mut state = rec.lock();
            state.leader = Some(InstanceId::ANY);
            state.resolved = true;
            return;
        }
        let mut state = rec.lock();
        resolve_locked(&mut state, &self.local);
    }

    fn is_deliverable(&self, rec: &TripletRecord, sender: InstanceId) -> bool {
        if Self::is_reserved(rec) {
            return true;
        }
        let mut state = rec.lock();
        if !state.resolved {
            // Unresolved leadership is retried on every delivery decision.
            resolve_locked(&mut state, &self.local);
        }
        state.resolved && state.leader.is_some_and(|l| l.matches(&sender))
    }

    fn has_leader_failed(&self, group: &GroupRecord, leader_rank: u32, new_seq: u64) -> bool {
        gap_exceeded(group, leader_rank, new_seq, self.trigger)
    }

    fn on_process_failed(&self, string_id: &str, failed: InstanceId) {
        fail_process(&self.registry, &self.local, string_id, failed, true);
    }
}
