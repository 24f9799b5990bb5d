// SPDX-License-Identifier: Apache-2.0

//! Leadership policy types.
//!
//! A policy is the cross product of a group selector and a rank selector; it
//! determines, for any inbound group message, whether the sender counts as
//! "the leader". A notify policy controls when the registered failure
//! callback fires.

use crate::identity::InstanceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which launch groups of a triplet are eligible to hold the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupSelect {
    /// Any launch batch of the triplet.
    All,
    /// Only the batch the local process belongs to.
    Local,
    /// One specific launch batch.
    Launch(u32),
}

/// Which rank within the eligible group(s) is the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankSelect {
    /// Every rank counts as a leader (no filtering by rank).
    All,
    /// The lowest currently-alive rank, re-resolved on membership change.
    LowestAlive,
    /// One specific rank.
    Rank(u32),
}

/// When the failure callback fires on a process-failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    /// Never notify.
    #[default]
    None,
    /// Notify only when the failed process was the current leader.
    LeaderOnly,
    /// Notify when the failed process shares a launch batch with a
    /// leader-eligible group.
    EligibleGroup,
    /// Notify on every failure of the triplet.
    Any,
}

/// Group selector × rank selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadershipPolicy {
    pub groups: GroupSelect,
    pub ranks: RankSelect,
}

impl Default for LeadershipPolicy {
    fn default() -> Self {
        Self {
            groups: GroupSelect::All,
            ranks: RankSelect::LowestAlive,
        }
    }
}

/// Invoked with (canonical triplet id, failed identity, previous leader if
/// one was resolved at the time of the failure).
pub type FailureCallback = Arc<dyn Fn(&str, InstanceId, Option<InstanceId>) + Send + Sync>;
