// SPDX-License-Identifier: Apache-2.0

//! End-to-end properties over the in-memory transport: several substrates
//! wired through one hub, discovering each other and filtering delivery
//! through leader selection.

use bytes::Bytes;
use groupcast::config::Strategy;
use groupcast::discovery::InputHandler;
use groupcast::transport::{MockHub, MockTransport, Transport};
use groupcast::policy::FailureCallback;
use groupcast::{
    AppTriplet, GroupSelect, InstanceId, NotifyPolicy, RankSelect, Substrate, SubstrateConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Party {
    substrate: Arc<Substrate>,
    transport: Arc<MockTransport>,
}

fn spawn_party(hub: &MockHub, id: &str, instance: InstanceId, trigger: u64) -> Party {
    let (transport, mut rx) = hub.attach();
    transport.set_identity(id, instance);
    let transport = Arc::new(transport);
    let config = SubstrateConfig {
        strategy: Strategy::LowestAlive,
        failure_trigger: trigger,
        launch_id: instance.launch_id,
        rank: instance.rank,
        ..Default::default()
    };
    let substrate = Arc::new(Substrate::new(config, transport.clone()).unwrap());
    let pump = substrate.clone();
    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            pump.ingest(env).await;
        }
    });
    Party {
        substrate,
        transport,
    }
}

fn counting_handler() -> (InputHandler, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler: InputHandler = {
        let hits = hits.clone();
        Arc::new(move |_env| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };
    (handler, hits)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

fn output_channel(party: &Party) -> u32 {
    party
        .substrate
        .engine()
        .local()
        .get()
        .expect("party announced")
        .output_channel
}

#[tokio::test]
async fn test_discovery_converges_across_parties() {
    let hub = MockHub::new();
    let a = spawn_party(&hub, "app/1/1", InstanceId::new(1, 0), 8);
    let b = spawn_party(&hub, "app/1/1", InstanceId::new(1, 1), 8);
    let c = spawn_party(&hub, "app/1/1", InstanceId::new(1, 2), 8);

    a.substrate.announce("app", "1", "1").await.unwrap();
    b.substrate.announce("app", "1", "1").await.unwrap();
    c.substrate.announce("app", "1", "1").await.unwrap();
    settle().await;

    // Echo/response reconciles even the parties that announced first.
    for party in [&a, &b, &c] {
        let rec = party
            .substrate
            .registry()
            .lookup_by_string_id("app/1/1")
            .expect("triplet known everywhere");
        let state = rec.lock();
        assert_eq!(state.total_processes, 3);
        let group = state.groups.get(&1).expect("launch group known");
        let g = group.lock();
        for rank in 0..3 {
            assert!(g.source(rank).is_some_and(|s| s.alive), "rank {rank} alive");
        }
    }

    a.substrate.shutdown().await;
    b.substrate.shutdown().await;
    c.substrate.shutdown().await;
}

#[tokio::test]
async fn test_leader_filtering_and_direct_bypass() {
    let hub = MockHub::new();
    let obs = spawn_party(&hub, "obs/1/1", InstanceId::new(9, 0), 8);
    let w1 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 1), 8);
    let w2 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 2), 8);

    obs.substrate.announce("obs", "1", "1").await.unwrap();
    let (handler, hits) = counting_handler();
    obs.substrate
        .register_input(AppTriplet::exact("app", "1", "1"), 7, handler)
        .await
        .unwrap();

    w1.substrate.announce("app", "1", "1").await.unwrap();
    w2.substrate.announce("app", "1", "1").await.unwrap();
    settle().await;

    // Pin leadership to rank 2 of launch batch 1 via policy.
    obs.substrate
        .set_policy(
            &AppTriplet::exact("app", "1", "1"),
            GroupSelect::Launch(1),
            RankSelect::Rank(2),
            NotifyPolicy::None,
            None,
        )
        .unwrap();
    assert_eq!(
        obs.substrate.get_leader("app", "1", "1"),
        Some(InstanceId::new(1, 2))
    );

    let channel = output_channel(&w1);
    assert_eq!(channel, output_channel(&w2));

    // Broadcast from rank 1 is filtered; rank 2 is delivered.
    w1.transport
        .broadcast(channel, 7, Bytes::from_static(b"from-1"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    w2.transport
        .broadcast(channel, 7, Bytes::from_static(b"from-2"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The same non-leader payload on the direct channel is delivered, since
    // direct delivery only checks liveness.
    w1.transport
        .send_direct(InstanceId::new(9, 0), 7, Bytes::from_static(b"direct"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    obs.substrate.shutdown().await;
    w1.substrate.shutdown().await;
    w2.substrate.shutdown().await;
}

#[tokio::test]
async fn test_sequence_gap_fails_leader_and_reelects() {
    let hub = MockHub::new();
    let obs = spawn_party(&hub, "obs/1/1", InstanceId::new(9, 0), 5);
    let w0 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 0), 5);
    let w1 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 1), 5);

    obs.substrate.announce("obs", "1", "1").await.unwrap();
    let (handler, hits) = counting_handler();
    obs.substrate
        .register_input(AppTriplet::exact("app", "1", "1"), 7, handler)
        .await
        .unwrap();
    w0.substrate.announce("app", "1", "1").await.unwrap();
    w1.substrate.announce("app", "1", "1").await.unwrap();
    settle().await;

    assert_eq!(
        obs.substrate.get_leader("app", "1", "1"),
        Some(InstanceId::new(1, 0))
    );

    let channel = output_channel(&w0);

    // The leader speaks once, then goes silent.
    w0.transport
        .broadcast(channel, 7, Bytes::from_static(b"leader"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // A peer runs ahead. Its first messages are filtered (it is not the
    // leader); once its forward gap exceeds the trigger the leader is
    // declared dead and the peer is elected, so that message is delivered.
    for _ in 0..7 {
        w1.transport
            .broadcast(channel, 7, Bytes::from_static(b"peer"))
            .await
            .unwrap();
    }
    settle().await;

    assert_eq!(
        obs.substrate.get_leader("app", "1", "1"),
        Some(InstanceId::new(1, 1))
    );
    let rec = obs
        .substrate
        .registry()
        .lookup_by_string_id("app/1/1")
        .unwrap();
    let dead = {
        let state = rec.lock();
        let g = state.groups.get(&1).unwrap().lock().source(0).unwrap().clone();
        !g.alive
    };
    assert!(dead, "silent leader marked not alive");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    obs.substrate.shutdown().await;
    w0.substrate.shutdown().await;
    w1.substrate.shutdown().await;
}

#[tokio::test]
async fn test_leader_failure_notification_via_launch_report() {
    let hub = MockHub::new();
    let obs = spawn_party(&hub, "obs/1/1", InstanceId::new(9, 0), 8);
    let w0 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 0), 8);
    let w1 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 1), 8);

    obs.substrate.announce("obs", "1", "1").await.unwrap();
    w0.substrate.announce("app", "1", "1").await.unwrap();
    w1.substrate.announce("app", "1", "1").await.unwrap();
    settle().await;

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let cb: FailureCallback = {
        let seen = seen.clone();
        Arc::new(
            move |id: &str, failed: InstanceId, old: Option<InstanceId>| {
                seen.lock().push((id.to_string(), failed, old));
            },
        )
    };
    obs.substrate
        .set_policy(
            &AppTriplet::exact("app", "1", "1"),
            GroupSelect::All,
            RankSelect::LowestAlive,
            NotifyPolicy::LeaderOnly,
            Some(cb),
        )
        .unwrap();
    assert_eq!(
        obs.substrate.get_leader("app", "1", "1"),
        Some(InstanceId::new(1, 0))
    );

    // Non-leader failure: no notification, leader unchanged.
    obs.substrate
        .on_process_failed("app/1/1", InstanceId::new(1, 1));
    assert!(seen.lock().is_empty());
    assert_eq!(
        obs.substrate.get_leader("app", "1", "1"),
        Some(InstanceId::new(1, 0))
    );

    // Leader failure: callback fires with the old leader captured.
    obs.substrate
        .on_process_failed("app/1/1", InstanceId::new(1, 0));
    let events = seen.lock().clone();
    assert_eq!(
        events,
        vec![(
            "app/1/1".to_string(),
            InstanceId::new(1, 0),
            Some(InstanceId::new(1, 0))
        )]
    );
    // Both ranks are gone now, so leadership is unresolved.
    assert_eq!(obs.substrate.get_leader("app", "1", "1"), None);

    obs.substrate.shutdown().await;
    w0.substrate.shutdown().await;
    w1.substrate.shutdown().await;
}

#[tokio::test]
async fn test_deregister_stops_delivery() {
    let hub = MockHub::new();
    let obs = spawn_party(&hub, "obs/1/1", InstanceId::new(9, 0), 8);
    let w0 = spawn_party(&hub, "app/1/1", InstanceId::new(1, 0), 8);

    obs.substrate.announce("obs", "1", "1").await.unwrap();
    let (handler, hits) = counting_handler();
    obs.substrate
        .register_input(AppTriplet::exact("app", "1", "1"), 7, handler)
        .await
        .unwrap();
    w0.substrate.announce("app", "1", "1").await.unwrap();
    settle().await;

    let channel = output_channel(&w0);
    w0.transport
        .broadcast(channel, 7, Bytes::from_static(b"one"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    obs.substrate
        .deregister_input(&AppTriplet::exact("app", "1", "1"), 7)
        .await
        .unwrap();
    w0.transport
        .broadcast(channel, 7, Bytes::from_static(b"two"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    obs.substrate.shutdown().await;
    w0.substrate.shutdown().await;
}
