// SPDX-License-Identifier: Apache-2.0

//! Message dispatcher.
//!
//! Announcements are handled synchronously in-line with receipt, so a
//! just-announced peer's next message always finds its registration. All
//! other inbound traffic is queued to one worker task that drains strictly
//! in arrival order per channel; there is no cross-channel ordering
//! guarantee.
//!
//! Sequence numbers feed gap-based leader failure detection only — a gap is
//! logged and the message still delivered, never used for admission control.
//! Per-message errors are swallowed so one bad message cannot stall a
//! channel.

use crate::discovery::DiscoveryEngine;
use crate::identity::WILDCARD;
use crate::leader::LeaderSelector;
use crate::protocols::ANNOUNCE_TAG;
use crate::registry::Registry;
use crate::transport::InboundEnvelope;
use crate::SubstrateConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct WorkerCtx {
    registry: Registry,
    selector: Arc<dyn LeaderSelector>,
    engine: DiscoveryEngine,
}

pub struct Dispatcher {
    tx: mpsc::Sender<InboundEnvelope>,
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    engine: DiscoveryEngine,
}

impl Dispatcher {
    /// Start the worker task. Must run inside a tokio runtime.
    pub fn spawn(
        registry: Registry,
        selector: Arc<dyn LeaderSelector>,
        engine: DiscoveryEngine,
        config: &SubstrateConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let cancel = CancellationToken::new();
        let ctx = WorkerCtx {
            registry,
            selector,
            engine: engine.clone(),
        };
        let worker = tokio::spawn(worker_loop(ctx, rx, cancel.clone()));
        Self {
            tx,
            cancel,
            worker: parking_lot::Mutex::new(Some(worker)),
            engine,
        }
    }

    /// Entry point for the transport's receive path.
    pub async fn ingest(&self, env: InboundEnvelope) {
        if env.channel == self.engine.discovery_channel() && env.tag == ANNOUNCE_TAG {
            self.engine.handle_announcement(env).await;
            return;
        }
        if self.tx.send(env).await.is_err() {
            tracing::debug!("dispatch queue closed; message dropped");
        }
    }

    /// Stop the worker and wait for it to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "dispatch worker join failed");
            }
        }
    }
}

async fn worker_loop(
    ctx: WorkerCtx,
    mut rx: mpsc::Receiver<InboundEnvelope>,
    cancel: CancellationToken,
) {
    tracing::debug!("dispatch worker started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(env) => ctx.process(env).await,
                None => break,
            },
        }
    }
    tracing::debug!("dispatch worker stopped");
}

impl WorkerCtx {
    async fn process(&self, env: InboundEnvelope) {
        let Some(rec) = self.registry.lookup_by_string_id(&env.sender_id) else {
            tracing::debug!(sender = %env.sender, id = %env.sender_id, "message from unknown identity dropped");
            return;
        };

        if env.is_direct() {
            // Point-to-point: delivered unconditionally subject to liveness.
            let alive = {
                let state = rec.lock();
                state
                    .groups
                    .get(&env.sender.launch_id)
                    .and_then(|g| g.lock().source(env.sender.rank).map(|s| s.alive))
                    .unwrap_or(false)
            };
            if !alive {
                tracing::debug!(sender = %env.sender, "direct message from dead or unknown source dropped");
                return;
            }
            let Some(handler) = self
                .engine
                .find_direct_handler(rec.triplet(), env.tag)
                .await
            else {
                tracing::debug!(tag = env.tag, "no direct registration; message dropped");
                return;
            };
            handler(env);
            return;
        }

        // Group path: track the sender's sequence number first.
        let Some(group) =
            self.registry
                .get_or_create_source_by_identity(&rec, env.sender, true)
        else {
            return;
        };
        self.registry.note_contact(&rec, &group, env.sender.rank);
        {
            let mut g = group.lock();
            let Some(src) = g.get_or_create_source(env.sender.rank, false) else {
                return;
            };
            if let Some(prev) = src.observe_seq(env.sequence) {
                if env.sequence != prev.wrapping_add(1) {
                    tracing::warn!(
                        sender = %env.sender,
                        channel = env.channel,
                        prev,
                        seq = env.sequence,
                        "sequence gap on group channel"
                    );
                }
            }
        }

        // Feed gap evidence into failure detection when a non-leader runs
        // ahead of a concrete leader in the same group.
        let leader = {
            let state = rec.lock();
            state.resolved.then_some(state.leader).flatten()
        };
        if let Some(leader) = leader {
            if leader.rank != WILDCARD
                && leader.launch_id == env.sender.launch_id
                && leader != env.sender
                && self
                    .selector
                    .has_leader_failed(&group, leader.rank, env.sequence)
            {
                tracing::warn!(id = rec.id(), %leader, "leader declared failed on sequence evidence");
                self.selector.on_process_failed(rec.id(), leader);
            }
        }

        if !self.selector.is_deliverable(&rec, env.sender) {
            tracing::trace!(sender = %env.sender, "group message filtered: sender is not the leader");
            return;
        }
        let Some(handler) = self.engine.find_handler(env.channel, env.tag) else {
            tracing::debug!(channel = env.channel, tag = env.tag, "no registration for channel; message dropped");
            return;
        };
        handler(env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::identity::{AppTriplet, InstanceId, LocalIdentity};
    use crate::leader;
    use crate::transport::{MockHub, Transport};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Party {
        dispatcher: Arc<Dispatcher>,
        engine: DiscoveryEngine,
        registry: Registry,
        selector: Arc<dyn LeaderSelector>,
        transport: Arc<crate::transport::MockTransport>,
        rx: Option<mpsc::UnboundedReceiver<InboundEnvelope>>,
    }

    fn party(hub: &MockHub, launch_id: u32, rank: u32) -> Party {
        let (transport, rx) = hub.attach();
        let transport = Arc::new(transport);
        let config = SubstrateConfig {
            launch_id,
            rank,
            failure_trigger: 5,
            ..Default::default()
        };
        let registry = Registry::new();
        let local = LocalIdentity::new();
        let selector = leader::for_strategy(
            Strategy::LowestAlive,
            registry.clone(),
            local.clone(),
            config.failure_trigger,
        );
        let engine = DiscoveryEngine::new(
            registry.clone(),
            transport.clone(),
            local,
            &config,
        );
        let dispatcher = Arc::new(Dispatcher::spawn(
            registry.clone(),
            selector.clone(),
            engine.clone(),
            &config,
        ));
        Party {
            dispatcher,
            engine,
            registry,
            selector,
            transport,
            rx: Some(rx),
        }
    }

    fn drive(party: &mut Party) {
        let mut rx = party.rx.take().unwrap();
        let dispatcher = party.dispatcher.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                dispatcher.ingest(env).await;
            }
        });
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_group_delivery_filtered_by_leader() {
        let hub = MockHub::new();
        let mut receiver = party(&hub, 1, 0);
        let mut rank1 = party(&hub, 1, 1);
        let mut rank2 = party(&hub, 1, 2);
        receiver.transport.set_identity("recv/1/1", InstanceId::new(1, 0));
        rank1.transport.set_identity("app/1/1", InstanceId::new(1, 1));
        rank2.transport.set_identity("app/1/1", InstanceId::new(1, 2));
        drive(&mut receiver);
        drive(&mut rank1);
        drive(&mut rank2);

        receiver.engine.announce("recv", "1", "1").await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler: crate::discovery::InputHandler = {
            let hits = hits.clone();
            Arc::new(move |_env| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        receiver
            .engine
            .register_input(AppTriplet::exact("app", "1", "1"), 7, handler)
            .await
            .unwrap();

        rank1.engine.announce("app", "1", "1").await.unwrap();
        rank2.engine.announce("app", "1", "1").await.unwrap();
        settle().await;

        // Lowest alive rank in launch 1 of app/1/1 would be rank 1; kill it
        // so rank 2 leads.
        let rec = receiver.registry.lookup_by_string_id("app/1/1").unwrap();
        receiver
            .selector
            .on_process_failed("app/1/1", InstanceId::new(1, 1));
        receiver.selector.resolve_leader(&rec);
        assert_eq!(rec.lock().leader, Some(InstanceId::new(1, 2)));

        // A broadcast from rank 1 (not the leader) is filtered out.
        let channel = receiver
            .registry
            .lookup_by_string_id("app/1/1")
            .unwrap()
            .lock()
            .groups
            .get(&1)
            .unwrap()
            .lock()
            .channel
            .unwrap();
        rank1
            .transport
            .broadcast(channel, 7, Bytes::from_static(b"m1"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // The same payload from the leader is delivered.
        rank2
            .transport
            .broadcast(channel, 7, Bytes::from_static(b"m2"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        receiver.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_sequence_gap_warns_but_still_delivers() {
        let hub = MockHub::new();
        let mut receiver = party(&hub, 1, 0);
        let mut rank1 = party(&hub, 1, 1);
        receiver.transport.set_identity("recv/1/1", InstanceId::new(1, 0));
        rank1.transport.set_identity("app/1/1", InstanceId::new(1, 1));
        drive(&mut receiver);
        drive(&mut rank1);

        receiver.engine.announce("recv", "1", "1").await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler: crate::discovery::InputHandler = {
            let hits = hits.clone();
            Arc::new(move |_env| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        receiver
            .engine
            .register_input(AppTriplet::exact("app", "1", "1"), 7, handler)
            .await
            .unwrap();
        rank1.engine.announce("app", "1", "1").await.unwrap();
        settle().await;

        let channel = receiver
            .registry
            .lookup_by_string_id("app/1/1")
            .unwrap()
            .lock()
            .groups
            .get(&1)
            .unwrap()
            .lock()
            .channel
            .unwrap();

        // Feed the leader's traffic with a hole in the sequence numbers.
        // The gap is logged; it is never admission control.
        for sequence in [1u64, 5u64] {
            receiver
                .dispatcher
                .ingest(InboundEnvelope {
                    channel,
                    tag: 7,
                    sender_id: "app/1/1".into(),
                    sender: InstanceId::new(1, 1),
                    sequence,
                    payload: Bytes::from_static(b"m"),
                })
                .await;
        }
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        receiver.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffer_registration_receives_payload_bytes() {
        let hub = MockHub::new();
        let mut receiver = party(&hub, 1, 0);
        let mut sender = party(&hub, 1, 1);
        receiver.transport.set_identity("recv/1/1", InstanceId::new(1, 0));
        sender.transport.set_identity("app/1/1", InstanceId::new(1, 1));
        drive(&mut receiver);
        drive(&mut sender);

        receiver.engine.announce("recv", "1", "1").await.unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let handler: Arc<dyn Fn(Bytes) + Send + Sync> = {
            let seen = seen.clone();
            Arc::new(move |payload| {
                *seen.lock() = Some(payload);
            })
        };
        receiver
            .engine
            .register_input_buffer(AppTriplet::exact("app", "1", "1"), 7, handler)
            .await
            .unwrap();

        sender.engine.announce("app", "1", "1").await.unwrap();
        settle().await;

        let channel = sender.engine.local().get().unwrap().output_channel;
        sender
            .transport
            .broadcast(channel, 7, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().as_deref(), Some(b"hello".as_slice()));

        receiver.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_contact_via_traffic_counts_process() {
        let hub = MockHub::new();
        let mut receiver = party(&hub, 1, 0);
        let mut rank1 = party(&hub, 1, 1);
        let rank2 = party(&hub, 1, 2);
        receiver.transport.set_identity("recv/1/1", InstanceId::new(1, 0));
        rank1.transport.set_identity("app/1/1", InstanceId::new(1, 1));
        rank2.transport.set_identity("app/1/1", InstanceId::new(1, 2));
        drive(&mut receiver);
        drive(&mut rank1);

        receiver.engine.announce("recv", "1", "1").await.unwrap();
        let noop: crate::discovery::InputHandler = Arc::new(|_env| {});
        receiver
            .engine
            .register_input(AppTriplet::exact("app", "1", "1"), 7, noop)
            .await
            .unwrap();
        rank1.engine.announce("app", "1", "1").await.unwrap();
        settle().await;

        let rec = receiver.registry.lookup_by_string_id("app/1/1").unwrap();
        assert_eq!(rec.lock().total_processes, 1);

        // Rank 2 never announces; its first group message is still first
        // contact and the known process count follows.
        let channel = rec.lock().groups.get(&1).unwrap().lock().channel.unwrap();
        rank2
            .transport
            .broadcast(channel, 7, Bytes::from_static(b"m"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(rec.lock().total_processes, 2);

        receiver.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_delivery_requires_liveness_only() {
        let hub = MockHub::new();
        let mut receiver = party(&hub, 1, 0);
        let sender = party(&hub, 1, 1);
        receiver.transport.set_identity("recv/1/1", InstanceId::new(1, 0));
        sender.transport.set_identity("app/1/1", InstanceId::new(1, 1));
        drive(&mut receiver);

        receiver.engine.announce("recv", "1", "1").await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler: crate::discovery::InputHandler = {
            let hits = hits.clone();
            Arc::new(move |_env| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        receiver
            .engine
            .register_input(AppTriplet::exact("app", "1", "1"), 9, handler)
            .await
            .unwrap();

        // Unknown sender: dropped.
        sender
            .transport
            .send_direct(InstanceId::new(1, 0), 9, Bytes::from_static(b"x"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Make the sender known and alive, bypassing leader resolution: the
        // direct path never consults the leader.
        sender.engine.announce("app", "1", "1").await.unwrap();
        settle().await;
        sender
            .transport
            .send_direct(InstanceId::new(1, 0), 9, Bytes::from_static(b"y"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        receiver.dispatcher.shutdown().await;
    }
}
