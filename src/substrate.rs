// SPDX-License-Identifier: Apache-2.0

//! The assembled substrate: registry, leader selector, discovery engine, and
//! dispatcher wired over one transport.
//!
//! This is the surface the collaborating subsystems use — the launch/spawn
//! layer reports failures and queries leadership here, the configuration
//! layer registers inputs and announces, and the transport pushes inbound
//! envelopes into [`Substrate::ingest`].

use crate::config::SubstrateConfig;
use crate::discovery::{DiscoveryEngine, InputHandler};
use crate::dispatch::Dispatcher;
use crate::identity::{AppTriplet, InstanceId, LocalIdentity};
use crate::leader::{self, LeaderSelector};
use crate::policy::{FailureCallback, GroupSelect, NotifyPolicy, RankSelect};
use crate::registry::Registry;
use crate::transport::{InboundEnvelope, Transport};
use crate::Result;
use bytes::Bytes;
use std::sync::Arc;

pub struct Substrate {
    config: SubstrateConfig,
    registry: Registry,
    selector: Arc<dyn LeaderSelector>,
    engine: DiscoveryEngine,
    dispatcher: Dispatcher,
}

impl Substrate {
    /// Assemble a substrate over `transport` and start its dispatch worker.
    /// Must run inside a tokio runtime.
    pub fn new(config: SubstrateConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let registry = Registry::new();
        let local = LocalIdentity::new();
        let selector = leader::for_strategy(
            config.strategy,
            registry.clone(),
            local.clone(),
            config.failure_trigger,
        );
        let engine = DiscoveryEngine::new(registry.clone(), transport, local, &config);
        let dispatcher = Dispatcher::spawn(registry.clone(), selector.clone(), engine.clone(), &config);
        tracing::debug!(strategy = %config.strategy, instance = %config.instance(), "substrate started");
        Ok(Self {
            config,
            registry,
            selector,
            engine,
            dispatcher,
        })
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn selector(&self) -> &Arc<dyn LeaderSelector> {
        &self.selector
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.engine
    }

    /// Entry point for the transport's receive path.
    pub async fn ingest(&self, env: InboundEnvelope) {
        self.dispatcher.ingest(env).await;
    }

    /// Advertise the local identity on the discovery channel. Idempotent.
    pub async fn announce(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
    ) -> Result<()> {
        self.engine.announce(name, version, release).await
    }

    /// Register an input callback for (triplet, tag); see
    /// [`DiscoveryEngine::register_input`].
    pub async fn register_input(
        &self,
        triplet: AppTriplet,
        tag: u32,
        handler: InputHandler,
    ) -> Result<()> {
        self.engine.register_input(triplet, tag, handler).await
    }

    /// Payload-only variant of [`Substrate::register_input`].
    pub async fn register_input_buffer(
        &self,
        triplet: AppTriplet,
        tag: u32,
        handler: Arc<dyn Fn(Bytes) + Send + Sync>,
    ) -> Result<()> {
        self.engine.register_input_buffer(triplet, tag, handler).await
    }

    pub async fn deregister_input(&self, triplet: &AppTriplet, tag: u32) -> Result<()> {
        self.engine.deregister_input(triplet, tag).await
    }

    /// Store a leadership policy for a triplet, creating its record when
    /// needed, and immediately resolve.
    pub fn set_policy(
        &self,
        triplet: &AppTriplet,
        groups: GroupSelect,
        ranks: RankSelect,
        notify: NotifyPolicy,
        failure_cb: Option<FailureCallback>,
    ) -> Result<()> {
        let rec = self
            .registry
            .get_or_create(triplet, true)
            .ok_or_else(|| crate::error!("registry refused record for {triplet}"))?;
        self.selector.set_policy(&rec, groups, ranks, notify, failure_cb)
    }

    /// Pin the leader for a triplet, or revert to policy-driven resolution.
    pub fn set_leader_explicit(&self, triplet: &AppTriplet, leader: Option<InstanceId>) {
        if let Some(rec) = self.registry.get_or_create(triplet, true) {
            self.selector.set_leader_explicit(&rec, leader);
        }
    }

    /// Current leader identity for a triplet, resolving first when needed.
    pub fn get_leader(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
    ) -> Option<InstanceId> {
        let triplet = AppTriplet::exact(name, version, release);
        let rec = self.registry.get_or_create(&triplet, false)?;
        if !rec.lock().resolved {
            self.selector.resolve_leader(&rec);
        }
        let state = rec.lock();
        state.resolved.then_some(state.leader).flatten()
    }

    /// Failure report from the launch layer.
    pub fn on_process_failed(&self, string_id: &str, failed: InstanceId) {
        self.selector.on_process_failed(string_id, failed);
    }

    /// Stop the dispatch worker and wait for it.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        tracing::debug!("substrate stopped");
    }
}
