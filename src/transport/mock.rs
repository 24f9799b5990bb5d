// SPDX-License-Identifier: Apache-2.0

//! In-memory transport for tests and examples.
//!
//! A [`MockHub`] wires any number of parties together: broadcasts fan out to
//! every party subscribed to `(channel, tag)` (the sender's own subscription
//! included), direct sends route by instance identity, and delivery order is
//! preserved per party. The hub stamps sender identity and per-channel
//! sequence numbers the way a real transport would.

use super::{InboundEnvelope, Transport};
use crate::identity::{InstanceId, NONE_SENTINEL};
use crate::registry::ChannelHandle;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Party {
    tx: mpsc::UnboundedSender<InboundEnvelope>,
    subs: HashSet<(ChannelHandle, u32)>,
    identity: Option<(String, InstanceId)>,
    /// Outbound sequence per channel for this party.
    seq: HashMap<ChannelHandle, u64>,
}

#[derive(Default)]
struct HubState {
    next_channel: ChannelHandle,
    channels: HashMap<String, ChannelHandle>,
    parties: HashMap<u64, Party>,
    next_party: u64,
}

/// Shared in-memory bus connecting mock transports.
#[derive(Clone, Default)]
pub struct MockHub {
    state: Arc<Mutex<HubState>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new party. Returns its transport plus the receive side the
    /// party's ingest loop drains.
    pub fn attach(&self) -> (MockTransport, mpsc::UnboundedReceiver<InboundEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_party;
        state.next_party += 1;
        state.parties.insert(
            id,
            Party {
                tx,
                subs: HashSet::new(),
                identity: None,
                seq: HashMap::new(),
            },
        );
        (
            MockTransport {
                hub: self.clone(),
                party: id,
            },
            rx,
        )
    }
}

/// One party's handle onto the [`MockHub`].
pub struct MockTransport {
    hub: MockHub,
    party: u64,
}

impl MockTransport {
    /// Stamp outbound traffic from this party with the given identity.
    pub fn set_identity(&self, sender_id: impl Into<String>, instance: InstanceId) {
        let mut state = self.hub.state.lock();
        if let Some(party) = state.parties.get_mut(&self.party) {
            party.identity = Some((sender_id.into(), instance));
        }
    }

    fn stamp(state: &mut HubState, party: u64, channel: ChannelHandle) -> (String, InstanceId, u64) {
        let p = state
            .parties
            .get_mut(&party)
            .expect("sending party detached");
        let (sender_id, sender) = p
            .identity
            .clone()
            .unwrap_or_else(|| (String::new(), InstanceId::NONE));
        let seq = p.seq.entry(channel).or_insert(0);
        *seq += 1;
        (sender_id, sender, *seq)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn broadcast(&self, channel: ChannelHandle, tag: u32, payload: Bytes) -> Result<()> {
        let mut state = self.hub.state.lock();
        let (sender_id, sender, sequence) = Self::stamp(&mut state, self.party, channel);
        let env = InboundEnvelope {
            channel,
            tag,
            sender_id,
            sender,
            sequence,
            payload,
        };
        for party in state.parties.values() {
            if party.subs.contains(&(channel, tag)) {
                // Receiver may have shut down; a closed queue is not an error.
                let _ = party.tx.send(env.clone());
            }
        }
        Ok(())
    }

    async fn send_direct(&self, to: InstanceId, tag: u32, payload: Bytes) -> Result<()> {
        let mut state = self.hub.state.lock();
        let (sender_id, sender, sequence) = Self::stamp(&mut state, self.party, NONE_SENTINEL);
        let env = InboundEnvelope {
            channel: NONE_SENTINEL,
            tag,
            sender_id,
            sender,
            sequence,
            payload,
        };
        let target = state
            .parties
            .values()
            .find(|p| p.identity.as_ref().is_some_and(|(_, id)| *id == to))
            .ok_or_else(|| crate::error!("no party with identity {to}"))?;
        let _ = target.tx.send(env);
        Ok(())
    }

    async fn open_channel(&self, group_key: &str) -> Result<ChannelHandle> {
        let mut state = self.hub.state.lock();
        if let Some(ch) = state.channels.get(group_key) {
            return Ok(*ch);
        }
        // Channel 0 is reserved for the well-known discovery channel.
        let ch = state.next_channel + 1;
        state.next_channel = ch;
        state.channels.insert(group_key.to_string(), ch);
        Ok(ch)
    }

    async fn subscribe(&self, channel: ChannelHandle, tag: u32) -> Result<()> {
        let mut state = self.hub.state.lock();
        let party = state
            .parties
            .get_mut(&self.party)
            .ok_or_else(|| crate::error!("party detached"))?;
        party.subs.insert((channel, tag));
        Ok(())
    }

    async fn cancel_subscribe(&self, channel: ChannelHandle, tag: u32) -> Result<()> {
        let mut state = self.hub.state.lock();
        let party = state
            .parties
            .get_mut(&self.party)
            .ok_or_else(|| crate::error!("party detached"))?;
        party.subs.remove(&(channel, tag));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_only_subscribers() {
        let hub = MockHub::new();
        let (a, _a_rx) = hub.attach();
        let (b, mut b_rx) = hub.attach();
        let (_c, mut c_rx) = hub.attach();
        a.set_identity("app/1/1", InstanceId::new(1, 0));
        b.set_identity("app/1/1", InstanceId::new(1, 1));

        b.subscribe(5, 9).await.unwrap();
        a.broadcast(5, 9, Bytes::from_static(b"hi")).await.unwrap();

        let env = b_rx.recv().await.unwrap();
        assert_eq!(env.channel, 5);
        assert_eq!(env.sender, InstanceId::new(1, 0));
        assert_eq!(env.sequence, 1);
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_routes_by_identity() {
        let hub = MockHub::new();
        let (a, _a_rx) = hub.attach();
        let (b, mut b_rx) = hub.attach();
        a.set_identity("app/1/1", InstanceId::new(1, 0));
        b.set_identity("app/1/1", InstanceId::new(1, 1));

        a.send_direct(InstanceId::new(1, 1), 3, Bytes::from_static(b"p"))
            .await
            .unwrap();
        let env = b_rx.recv().await.unwrap();
        assert!(env.is_direct());
        assert_eq!(env.tag, 3);

        assert!(a
            .send_direct(InstanceId::new(9, 9), 3, Bytes::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_channel_is_stable_per_group_key() {
        let hub = MockHub::new();
        let (a, _arx) = hub.attach();
        let (b, _brx) = hub.attach();
        let c1 = a.open_channel("app/1/1:4").await.unwrap();
        let c2 = b.open_channel("app/1/1:4").await.unwrap();
        let c3 = b.open_channel("app/1/1:5").await.unwrap();
        assert_eq!(c1, c2);
        assert_ne!(c1, c3);
        assert_ne!(c1, 0);
    }
}
