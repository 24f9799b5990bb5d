// SPDX-License-Identifier: Apache-2.0

//! Substrate configuration.
//!
//! Built from defaults merged with `GC_`-prefixed environment variables
//! (e.g. `GC_STRATEGY=passthrough`, `GC_FAILURE_TRIGGER=16`, `GC_LAUNCH_ID`,
//! `GC_RANK`). Tests construct the struct directly or through the builder.

use crate::identity::InstanceId;
use derive_builder::Builder;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which leader-selection strategy the substrate runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Auto-elect the lowest alive rank (default).
    #[default]
    LowestAlive,
    /// Accept everyone; leader filtering disabled.
    Passthrough,
    /// Accept only an explicitly pinned leader.
    Pinned,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowestAlive => write!(f, "lowest-alive"),
            Self::Passthrough => write!(f, "passthrough"),
            Self::Pinned => write!(f, "pinned"),
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lowest-alive" | "lowest_alive" => Ok(Self::LowestAlive),
            "passthrough" => Ok(Self::Passthrough),
            "pinned" | "explicit" => Ok(Self::Pinned),
            _ => Err(anyhow::anyhow!(
                "invalid strategy: '{}'. Valid options are: 'lowest-alive', 'passthrough', 'pinned'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(default, setter(into))]
pub struct SubstrateConfig {
    /// Leader-selection strategy.
    pub strategy: Strategy,
    /// Max forward sequence gap tolerated before the leader is declared
    /// dead.
    pub failure_trigger: u64,
    /// Well-known channel announcements travel on.
    pub discovery_channel: u32,
    /// Dispatcher worker queue depth.
    pub queue_depth: usize,
    /// Launch batch this process belongs to, assigned by the launcher.
    pub launch_id: u32,
    /// Rank of this process within its launch batch.
    pub rank: u32,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            failure_trigger: 8,
            discovery_channel: 0,
            queue_depth: 1024,
            launch_id: 0,
            rank: 0,
        }
    }
}

impl SubstrateConfig {
    pub fn builder() -> SubstrateConfigBuilder {
        SubstrateConfigBuilder::default()
    }

    /// Defaults overlaid with `GC_`-prefixed environment variables.
    pub fn from_env() -> crate::Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("GC_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.queue_depth == 0 {
            crate::raise!("queue_depth must be non-zero");
        }
        Ok(())
    }

    /// Local instance identity as announced to peers.
    pub fn instance(&self) -> InstanceId {
        InstanceId::new(self.launch_id, self.rank)
    }
}
