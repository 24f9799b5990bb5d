// SPDX-License-Identifier: Apache-2.0

//! Discovery / announcement engine.
//!
//! Broadcasts the local identity on the well-known discovery channel,
//! absorbs peers' announcements into the registry, and maintains input
//! registrations against the channels each group is known to use.
//!
//! Anti-storm invariant: a process echoes an original announcement exactly
//! once, addressed to the asker, and never echoes an echo. Decode and
//! protocol errors are logged and the single announcement dropped; the
//! engine never aborts.

use crate::config::SubstrateConfig;
use crate::identity::{AppTriplet, InstanceId, LocalIdentity, LocalInfo};
use crate::protocols::{Announcement, ANNOUNCE_TAG};
use crate::registry::{ChannelHandle, Registry, TripletRecord};
use crate::transport::{InboundEnvelope, Transport};
use crate::Result;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Callback bound to an input registration; invoked by the dispatch worker.
pub type InputHandler = Arc<dyn Fn(InboundEnvelope) + Send + Sync>;

struct InputRegistration {
    triplet: AppTriplet,
    tag: u32,
    handler: InputHandler,
    /// Channels this registration is currently subscribed on.
    channels: HashSet<ChannelHandle>,
}

struct EngineInner {
    registry: Registry,
    transport: Arc<dyn Transport>,
    local: LocalIdentity,
    instance: InstanceId,
    discovery_channel: ChannelHandle,
    /// All registrations, bound or pending discovery.
    regs: Mutex<Vec<InputRegistration>>,
    /// Dispatch index: (channel, tag) → handler.
    index: DashMap<(ChannelHandle, u32), InputHandler>,
    /// Askers we have already echoed to.
    echoed: Mutex<HashSet<InstanceId>>,
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

impl DiscoveryEngine {
    pub fn new(
        registry: Registry,
        transport: Arc<dyn Transport>,
        local: LocalIdentity,
        config: &SubstrateConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                transport,
                local,
                instance: config.instance(),
                discovery_channel: config.discovery_channel,
                regs: Mutex::new(Vec::new()),
                index: DashMap::new(),
                echoed: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn discovery_channel(&self) -> ChannelHandle {
        self.inner.discovery_channel
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.inner.local
    }

    /// Advertise the local identity. Idempotent; only the first call records
    /// the identity and broadcasts.
    pub async fn announce(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.local.get().is_some() {
            tracing::debug!("local identity already announced");
            return Ok(());
        }
        let triplet = AppTriplet::exact(name, version, release);
        let id = triplet.canonical_id();
        let group_key = format!("{id}:{}", inner.instance.launch_id);
        let output_channel = inner.transport.open_channel(&group_key).await?;
        inner
            .transport
            .subscribe(inner.discovery_channel, ANNOUNCE_TAG)
            .await?;

        // Record ourselves before anyone can race us through the dispatcher.
        let Some(rec) = inner.registry.get_or_create(&triplet, true) else {
            crate::raise!("failed to register local triplet {id}");
        };
        record_member(&inner.registry, &rec, inner.instance, output_channel);

        inner.local.set(LocalInfo {
            triplet: triplet.clone(),
            instance: inner.instance,
            output_channel,
        });

        let ann = Announcement {
            triplet,
            output_channel,
            in_response_to: InstanceId::NONE,
        };
        tracing::info!(id, instance = %inner.instance, "announcing local identity");
        inner
            .transport
            .broadcast(inner.discovery_channel, ANNOUNCE_TAG, ann.encode())
            .await
    }

    /// Absorb one announcement, delivered synchronously on the receive path
    /// so a just-announced peer's next message finds its registration.
    pub async fn handle_announcement(&self, env: InboundEnvelope) {
        let inner = &self.inner;
        let ann = match Announcement::decode(env.payload.clone()) {
            Ok(ann) => ann,
            Err(e) => {
                tracing::warn!(error = %e, sender = %env.sender, "dropping malformed announcement");
                return;
            }
        };
        tracing::debug!(
            triplet = %ann.triplet,
            sender = %env.sender,
            channel = ann.output_channel,
            original = ann.is_original(),
            "announcement received"
        );

        let Some(rec) = inner.registry.get_or_create(&ann.triplet, true) else {
            return;
        };
        record_member(&inner.registry, &rec, env.sender, ann.output_channel);

        self.bind_channel(&ann.triplet, ann.output_channel).await;

        // Echo an original exactly once, to the asker; never echo an echo.
        // Until the local identity is announced there is nothing to echo, and
        // the asker keeps its one reply for when there is.
        if ann.is_original() && env.sender != inner.instance {
            if let Some(local) = inner.local.get() {
                let first = inner.echoed.lock().await.insert(env.sender);
                if first {
                    let reply = Announcement {
                        triplet: local.triplet.clone(),
                        output_channel: local.output_channel,
                        in_response_to: env.sender,
                    };
                    tracing::debug!(asker = %env.sender, "echoing announcement");
                    if let Err(e) = inner
                        .transport
                        .broadcast(inner.discovery_channel, ANNOUNCE_TAG, reply.encode())
                        .await
                    {
                        tracing::warn!(error = %e, "failed to echo announcement");
                    }
                }
            }
        }
    }

    /// Subscribe every matching registration to a newly learned channel.
    async fn bind_channel(&self, triplet: &AppTriplet, channel: ChannelHandle) {
        let inner = &self.inner;
        let to_bind: Vec<(u32, InputHandler)> = {
            let mut regs = inner.regs.lock().await;
            regs.iter_mut()
                .filter(|reg| reg.triplet.matches(triplet) && !reg.channels.contains(&channel))
                .map(|reg| {
                    reg.channels.insert(channel);
                    (reg.tag, reg.handler.clone())
                })
                .collect()
        };
        for (tag, handler) in to_bind {
            if let Err(e) = inner.transport.subscribe(channel, tag).await {
                tracing::warn!(channel, tag, error = %e, "channel subscribe failed");
                continue;
            }
            inner.index.insert((channel, tag), handler);
        }
    }

    /// Register an input callback for a triplet and tag. Subscribes
    /// immediately on every channel of matching known groups; otherwise the
    /// registration waits for discovery.
    pub async fn register_input(
        &self,
        triplet: AppTriplet,
        tag: u32,
        handler: InputHandler,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut channels = HashSet::new();
        for rec in inner.registry.exact_records() {
            if !rec.triplet().matches(&triplet) {
                continue;
            }
            let groups: Vec<_> = rec.lock().groups.values().cloned().collect();
            for group in groups {
                channels.extend(group.lock().peer_channels.iter().copied());
            }
        }
        for channel in &channels {
            inner.transport.subscribe(*channel, tag).await?;
            inner.index.insert((*channel, tag), handler.clone());
        }
        if channels.is_empty() {
            tracing::debug!(triplet = %triplet, tag, "input registration pending discovery");
        }
        inner.regs.lock().await.push(InputRegistration {
            triplet,
            tag,
            handler,
            channels,
        });
        Ok(())
    }

    /// [`register_input`] variant whose callback only sees the payload bytes.
    pub async fn register_input_buffer(
        &self,
        triplet: AppTriplet,
        tag: u32,
        handler: Arc<dyn Fn(Bytes) + Send + Sync>,
    ) -> Result<()> {
        self.register_input(triplet, tag, Arc::new(move |env| handler(env.payload)))
            .await
    }

    /// Drop the registration(s) made for exactly this (triplet, tag),
    /// cancelling their subscriptions on all currently known channels. A
    /// wildcard registration is only removed by deregistering the same
    /// wildcard triplet, never by one of the exact ids it matches.
    pub async fn deregister_input(&self, triplet: &AppTriplet, tag: u32) -> Result<()> {
        let inner = &self.inner;
        let removed: Vec<InputRegistration> = {
            let mut regs = inner.regs.lock().await;
            let mut kept = Vec::with_capacity(regs.len());
            let mut gone = Vec::new();
            for reg in regs.drain(..) {
                if reg.tag == tag && reg.triplet == *triplet {
                    gone.push(reg);
                } else {
                    kept.push(reg);
                }
            }
            *regs = kept;
            gone
        };
        for reg in removed {
            for channel in reg.channels {
                inner.index.remove(&(channel, tag));
                if let Err(e) = inner.transport.cancel_subscribe(channel, tag).await {
                    tracing::warn!(channel, tag, error = %e, "channel unsubscribe failed");
                }
            }
        }
        Ok(())
    }

    /// Dispatch index lookup for group traffic.
    pub fn find_handler(&self, channel: ChannelHandle, tag: u32) -> Option<InputHandler> {
        self.inner.index.get(&(channel, tag)).map(|h| h.clone())
    }

    /// Registration lookup for direct traffic, matched by sender triplet.
    pub async fn find_direct_handler(
        &self,
        sender: &AppTriplet,
        tag: u32,
    ) -> Option<InputHandler> {
        let regs = self.inner.regs.lock().await;
        regs.iter()
            .find(|reg| reg.tag == tag && reg.triplet.matches(sender))
            .map(|reg| reg.handler.clone())
    }
}

/// Record `identity` as a member source of `rec`, mark it alive (first
/// contact), and note its output channel. Bumps the triplet's total process
/// count when the source is new.
fn record_member(
    registry: &Registry,
    rec: &TripletRecord,
    identity: InstanceId,
    channel: ChannelHandle,
) {
    let Some(group) = registry.get_or_create_source_by_identity(rec, identity, true) else {
        return;
    };
    {
        let mut g = group.lock();
        g.peer_channels.insert(channel);
        if g.channel.is_none() {
            g.channel = Some(channel);
        }
    }
    registry.note_contact(rec, &group, identity.rank);
}
