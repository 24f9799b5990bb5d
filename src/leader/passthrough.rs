// SPDX-License-Identifier: Apache-2.0

//! Wildcard-passthrough strategy: the leader is "anyone", every group
//! message is deliverable, and nothing is ever re-elected. Failure reports
//! still update liveness and drive notifications.

use super::{fail_process, store_policy, LeaderSelector};
use crate::identity::{InstanceId, LocalIdentity};
use crate::policy::{FailureCallback, GroupSelect, NotifyPolicy, RankSelect};
use crate::registry::{GroupRecord, Registry, TripletRecord};
use crate::Result;

pub struct PassthroughSelector {
    registry: Registry,
    local: LocalIdentity,
}

impl PassthroughSelector {
    pub fn new(registry: Registry, local: LocalIdentity) -> Self {
        Self { registry, local }
    }
}

impl LeaderSelector for PassthroughSelector {
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
        // Policy is recorded for notification scoping only; delivery stays
        // wide open.
        self.resolve_leader(rec);
        Ok(())
    }

    fn set_leader_explicit(&self, _rec: &TripletRecord, _leader: Option<InstanceId>) {
        tracing::debug!("passthrough strategy ignores explicit leader assignment");
    }

    fn resolve_leader(&self, rec: &TripletRecord) {
        let mut state = rec.lock();
        state.leader = Some(InstanceId::ANY);
        state.resolved = true;
    }

    fn is_deliverable(&self, _rec: &TripletRecord, _sender: InstanceId) -> bool {
        true
    }

    fn has_leader_failed(&self, _group: &GroupRecord, _leader_rank: u32, _new_seq: u64) -> bool {
        false
    }

    fn on_process_failed(&self, string_id: &str, failed: InstanceId) {
        fail_process(&self.registry, &self.local, string_id, failed, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AppTriplet;

    #[test]
    fn test_everything_is_deliverable() {
        let registry = Registry::new();
        let sel = PassthroughSelector::new(registry.clone(), LocalIdentity::new());
        let rec = registry
            .get_or_create(&AppTriplet::exact("app", "1", "1"), true)
            .unwrap();
        sel.resolve_leader(&rec);
        assert!(sel.is_deliverable(&rec, InstanceId::new(0, 0)));
        assert!(sel.is_deliverable(&rec, InstanceId::new(42, 7)));
        assert_eq!(rec.lock().leader, Some(InstanceId::ANY));
    }
}
