// SPDX-License-Identifier: Apache-2.0

//! Identity Registry
//!
//! Process-wide table of every triplet this process has heard of, each
//! triplet's launch groups, and each group's member sources. The registry is
//! an injectable service (cheap to clone, `Arc` inner) so tests can run
//! several independent registries side by side.
//!
//! Locking is two-level: a table-wide `RwLock` protects scan/insert of the
//! triplet tables, and every record carries its own `parking_lot::Mutex`
//! acquired only after the table lock is released. The guard returned by
//! [`TripletRecord::lock`] / [`GroupRecord::lock`] auto-releases on drop, so
//! there is no manual unlock contract. Never re-enter a registry lookup while
//! holding a record guard for the same scope.

use crate::identity::{AppTriplet, InstanceId};
use crate::policy::{FailureCallback, LeadershipPolicy, NotifyPolicy};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Handle to a multicast channel, assigned by the transport.
pub type ChannelHandle = u32;

/// One process instance: rank, liveness, last observed sequence number.
///
/// Liveness goes false→true only on first contact and true→false only on an
/// explicit failure report.
#[derive(Debug, Clone, Default)]
pub struct SourceRecord {
    pub alive: bool,
    /// Whether this source has ever been heard from. First contact is the
    /// only transition to alive; an explicit failure report is final.
    contacted: bool,
    pub last_seq: Option<u64>,
}

impl SourceRecord {
    /// Record contact from this source. Returns true exactly once, on first
    /// contact, which is also the only transition to alive.
    pub fn contact(&mut self) -> bool {
        if self.contacted {
            return false;
        }
        self.contacted = true;
        self.alive = true;
        true
    }

    /// Observe a sequence number from this source; returns the previous one.
    pub fn observe_seq(&mut self, seq: u64) -> Option<u64> {
        self.last_seq.replace(seq)
    }
}

/// Mutable state of one launch group.
#[derive(Default)]
pub struct GroupState {
    /// Declared process count; monotonically non-decreasing.
    pub size: u32,
    /// Sparse rank → source map.
    pub sources: BTreeMap<u32, SourceRecord>,
    /// Rank holding the resolved leadership within this group, if any.
    pub leader_rank: Option<u32>,
    /// Our receive channel for this group, lazily opened on first subscribe.
    pub channel: Option<ChannelHandle>,
    /// Output channels peers have advertised for this group.
    pub peer_channels: BTreeSet<ChannelHandle>,
}

impl GroupState {
    /// Look up a source by rank, creating it (not alive, no sequence) when
    /// `create`. Growing past the declared size bumps the size; it never
    /// shrinks.
    pub fn get_or_create_source(&mut self, rank: u32, create: bool) -> Option<&mut SourceRecord> {
        if !create && !self.sources.contains_key(&rank) {
            return None;
        }
        if rank.checked_add(1).is_some_and(|n| n > self.size) {
            self.size = rank + 1;
        }
        Some(self.sources.entry(rank).or_default())
    }

    pub fn source(&self, rank: u32) -> Option<&SourceRecord> {
        self.sources.get(&rank)
    }

    /// Lowest alive rank, scanning ascending.
    pub fn lowest_alive_rank(&self) -> Option<u32> {
        self.sources
            .iter()
            .find(|(_, s)| s.alive)
            .map(|(rank, _)| *rank)
    }

    pub fn any_alive(&self) -> bool {
        self.sources.values().any(|s| s.alive)
    }
}

/// One launch batch of a triplet, keyed by launch id. Created lazily on first
/// rank reference and never removed before registry teardown.
pub struct GroupRecord {
    launch_id: u32,
    state: Mutex<GroupState>,
}

impl GroupRecord {
    fn new(launch_id: u32) -> Self {
        Self {
            launch_id,
            state: Mutex::new(GroupState::default()),
        }
    }

    pub fn launch_id(&self) -> u32 {
        self.launch_id
    }

    /// Acquire the record lock; released when the guard drops.
    pub fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock()
    }
}

/// Mutable state of a triplet record.
#[derive(Default)]
pub struct TripletState {
    /// Total processes known across all groups.
    pub total_processes: u32,
    /// Launch groups ordered by launch id.
    pub groups: BTreeMap<u32, Arc<GroupRecord>>,
    /// Configured leadership policy.
    pub policy: LeadershipPolicy,
    pub notify: NotifyPolicy,
    pub failure_cb: Option<FailureCallback>,
    /// Resolved leader identity; meaningful only when `resolved`.
    pub leader: Option<InstanceId>,
    pub resolved: bool,
    /// Leader was fixed via `set_leader_explicit`; policy resolution is
    /// suspended until it is cleared.
    pub pinned: bool,
}

impl TripletState {
    /// Look up a group by launch id, creating it when `create`.
    pub fn get_or_create_group(&mut self, launch_id: u32, create: bool) -> Option<Arc<GroupRecord>> {
        if let Some(group) = self.groups.get(&launch_id) {
            return Some(group.clone());
        }
        if !create {
            return None;
        }
        let group = Arc::new(GroupRecord::new(launch_id));
        self.groups.insert(launch_id, group.clone());
        Some(group)
    }
}

/// One (app, version, release) identity. Exactly one record exists per
/// distinct canonical id; wildcard ids live in a separate table matched only
/// by exact string.
pub struct TripletRecord {
    id: String,
    triplet: AppTriplet,
    state: Mutex<TripletState>,
}

impl TripletRecord {
    fn new(triplet: AppTriplet) -> Self {
        Self {
            id: triplet.canonical_id(),
            triplet,
            state: Mutex::new(TripletState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn triplet(&self) -> &AppTriplet {
        &self.triplet
    }

    /// Acquire the record lock; released when the guard drops.
    pub fn lock(&self) -> MutexGuard<'_, TripletState> {
        self.state.lock()
    }
}

#[derive(Default)]
struct RegistryInner {
    exact: RwLock<HashMap<String, Arc<TripletRecord>>>,
    wildcard: RwLock<HashMap<String, Arc<TripletRecord>>>,
}

/// The identity registry service.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact-string lookup across both tables.
    pub fn lookup_by_string_id(&self, id: &str) -> Option<Arc<TripletRecord>> {
        if let Some(rec) = self.inner.exact.read().get(id) {
            return Some(rec.clone());
        }
        self.inner.wildcard.read().get(id).cloned()
    }

    /// Scan every non-wildcard triplet for a group with this launch id.
    pub fn lookup_by_launch_id(&self, launch_id: u32) -> Option<Arc<TripletRecord>> {
        // Snapshot the table before touching record locks.
        let records: Vec<Arc<TripletRecord>> = self.inner.exact.read().values().cloned().collect();
        records
            .into_iter()
            .find(|rec| rec.lock().groups.contains_key(&launch_id))
    }

    /// Look up a triplet record by identity, creating it when `create`.
    /// Wildcard ids are stored in their own table.
    pub fn get_or_create(&self, triplet: &AppTriplet, create: bool) -> Option<Arc<TripletRecord>> {
        let id = triplet.canonical_id();
        let table = if triplet.has_wildcard() {
            &self.inner.wildcard
        } else {
            &self.inner.exact
        };
        if let Some(rec) = table.read().get(&id) {
            return Some(rec.clone());
        }
        if !create {
            return None;
        }
        let mut table = table.write();
        // Re-check under the write lock; another thread may have won the race.
        if let Some(rec) = table.get(&id) {
            return Some(rec.clone());
        }
        let rec = Arc::new(TripletRecord::new(triplet.clone()));
        tracing::debug!(id = %rec.id(), "registering triplet");
        table.insert(id, rec.clone());
        Some(rec)
    }

    /// Look up a group of `rec`, creating it when `create`.
    pub fn get_or_create_group(
        &self,
        rec: &TripletRecord,
        launch_id: u32,
        create: bool,
    ) -> Option<Arc<GroupRecord>> {
        rec.lock().get_or_create_group(launch_id, create)
    }

    /// Resolve `identity` to its group and source, creating both when
    /// `create`. Returns the group; the source is reachable under its lock.
    pub fn get_or_create_source_by_identity(
        &self,
        rec: &TripletRecord,
        identity: InstanceId,
        create: bool,
    ) -> Option<Arc<GroupRecord>> {
        let group = self.get_or_create_group(rec, identity.launch_id, create)?;
        {
            let mut state = group.lock();
            state.get_or_create_source(identity.rank, create)?;
        }
        Some(group)
    }

    /// Mark first contact from `rank` within `group`, bumping the owning
    /// triplet's total process count. Returns true exactly once per source,
    /// whether the member was learned from an announcement or from traffic.
    pub fn note_contact(&self, rec: &TripletRecord, group: &GroupRecord, rank: u32) -> bool {
        let first_contact = {
            let mut g = group.lock();
            g.get_or_create_source(rank, false)
                .is_some_and(|src| src.contact())
        };
        if first_contact {
            rec.lock().total_processes += 1;
        }
        first_contact
    }

    /// Run `f` under the record lock of the triplet with this canonical id.
    pub fn with_triplet<R>(&self, id: &str, f: impl FnOnce(&mut TripletState) -> R) -> Option<R> {
        let rec = self.lookup_by_string_id(id)?;
        let mut state = rec.lock();
        Some(f(&mut state))
    }

    /// Snapshot of every non-wildcard record, for wildcard-aware scans.
    pub fn exact_records(&self) -> Vec<Arc<TripletRecord>> {
        self.inner.exact.read().values().cloned().collect()
    }
}
