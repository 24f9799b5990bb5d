// SPDX-License-Identifier: Apache-2.0

//! groupcast
//!
//! Peer discovery and leader-filtered multicast messaging for a
//! cluster-management runtime. Processes identify themselves by an
//! (application, version, release) triplet; runtime instances of the same
//! triplet, grouped by launch batch, exchange messages over multicast
//! channels and point-to-point links.
//!
//! The crate is organized leaf-first:
//! - [`registry`] tracks every known triplet, launch group, and source
//! - [`leader`] selects which source's traffic is trusted for group delivery
//! - [`discovery`] broadcasts and absorbs announcements
//! - [`dispatch`] filters and delivers inbound messages to registered inputs
//!
//! "Leader" here means "trusted sender for delivery filtering" only; there is
//! no consensus protocol and no replicated state.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod config;
pub use config::SubstrateConfig;

pub mod discovery;
pub mod dispatch;
pub mod identity;
pub mod leader;
pub mod logging;
pub mod policy;
pub mod protocols;
pub mod registry;
pub mod substrate;
pub mod transport;

pub use discovery::DiscoveryEngine;
pub use dispatch::Dispatcher;
pub use identity::{AppTriplet, InstanceId};
pub use leader::LeaderSelector;
pub use policy::{GroupSelect, NotifyPolicy, RankSelect};
pub use registry::Registry;
pub use substrate::Substrate;
pub use tokio_util::sync::CancellationToken;
pub use transport::{InboundEnvelope, Transport};
