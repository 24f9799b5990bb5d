// SPDX-License-Identifier: Apache-2.0

//! Process identities.
//!
//! Every process advertises an application triplet (name, version, release)
//! plus an instance identity (launch batch id, rank). Any triplet field may be
//! a wildcard; on the wire wildcards and "none" are carried as reserved u32 /
//! string sentinels so the announcement layout stays fixed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved wire value meaning "matches anything".
pub const WILDCARD: u32 = u32::MAX;

/// Reserved wire value meaning "not set".
pub const NONE_SENTINEL: u32 = u32::MAX - 1;

/// Sentinel used when rendering a wildcard field into a canonical string id.
pub const WILDCARD_STR: &str = "*";

/// An (application, version, release) identity. `None` fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppTriplet {
    pub name: Option<String>,
    pub version: Option<String>,
    pub release: Option<String>,
}

impl AppTriplet {
    pub fn new(
        name: Option<impl Into<String>>,
        version: Option<impl Into<String>>,
        release: Option<impl Into<String>>,
    ) -> Self {
        Self {
            name: name.map(Into::into),
            version: version.map(Into::into),
            release: release.map(Into::into),
        }
    }

    /// A fully specified triplet with no wildcard fields.
    pub fn exact(
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            version: Some(version.into()),
            release: Some(release.into()),
        }
    }

    pub fn has_wildcard(&self) -> bool {
        self.name.is_none() || self.version.is_none() || self.release.is_none()
    }

    /// Canonical string id. Wildcard fields render as [`WILDCARD_STR`].
    ///
    /// Exactly one registry record exists per distinct canonical id.
    pub fn canonical_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.name.as_deref().unwrap_or(WILDCARD_STR),
            self.version.as_deref().unwrap_or(WILDCARD_STR),
            self.release.as_deref().unwrap_or(WILDCARD_STR),
        )
    }

    /// Wildcard-aware comparison: a `None` field on either side matches.
    pub fn matches(&self, other: &AppTriplet) -> bool {
        fn field(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
        }
        field(&self.name, &other.name)
            && field(&self.version, &other.version)
            && field(&self.release, &other.release)
    }
}

impl fmt::Display for AppTriplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_id())
    }
}

/// One process instance within a launch batch: (launch id, rank).
///
/// Either field may carry the [`WILDCARD`] or [`NONE_SENTINEL`] reserved
/// values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub launch_id: u32,
    pub rank: u32,
}

impl InstanceId {
    /// The "not set" identity.
    pub const NONE: InstanceId = InstanceId {
        launch_id: NONE_SENTINEL,
        rank: NONE_SENTINEL,
    };

    /// The "anyone" identity; both fields wildcard.
    pub const ANY: InstanceId = InstanceId {
        launch_id: WILDCARD,
        rank: WILDCARD,
    };

    pub fn new(launch_id: u32, rank: u32) -> Self {
        Self { launch_id, rank }
    }

    pub fn is_none(&self) -> bool {
        self.launch_id == NONE_SENTINEL && self.rank == NONE_SENTINEL
    }

    /// Wildcard-aware comparison; a [`WILDCARD`] field on either side matches.
    pub fn matches(&self, other: &InstanceId) -> bool {
        fn field(a: u32, b: u32) -> bool {
            a == WILDCARD || b == WILDCARD || a == b
        }
        field(self.launch_id, other.launch_id) && field(self.rank, other.rank)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part(v: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match v {
                WILDCARD => write!(f, "*"),
                NONE_SENTINEL => write!(f, "-"),
                v => write!(f, "{v}"),
            }
        }
        part(self.launch_id, f)?;
        write!(f, ".")?;
        part(self.rank, f)
    }
}

/// The identity this process announced, set once and shared between the
/// discovery engine and the leader selector.
#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub triplet: AppTriplet,
    pub instance: InstanceId,
    /// Our output channel for group traffic, opened at announce time.
    pub output_channel: u32,
}

#[derive(Clone, Default)]
pub struct LocalIdentity {
    inner: std::sync::Arc<std::sync::OnceLock<LocalInfo>>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the local identity; returns false if one was already set.
    pub fn set(&self, info: LocalInfo) -> bool {
        self.inner.set(info).is_ok()
    }

    pub fn get(&self) -> Option<&LocalInfo> {
        self.inner.get()
    }

    pub fn instance(&self) -> Option<InstanceId> {
        self.inner.get().map(|info| info.instance)
    }
}
