// SPDX-License-Identifier: Apache-2.0

//! Transport boundary.
//!
//! The substrate never moves bytes itself; it consumes a [`Transport`] that
//! provides multicast channels and reliable point-to-point delivery, and it
//! receives inbound traffic as [`InboundEnvelope`] values pushed by the
//! transport's receive path.

use crate::identity::{InstanceId, NONE_SENTINEL};
use crate::registry::ChannelHandle;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub mod mock;
pub use mock::{MockHub, MockTransport};

/// One inbound message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Receive channel, or [`NONE_SENTINEL`] for point-to-point delivery.
    pub channel: ChannelHandle,
    pub tag: u32,
    /// Canonical triplet id of the sender.
    pub sender_id: String,
    pub sender: InstanceId,
    /// Sender-monotonic sequence number for this channel.
    pub sequence: u64,
    pub payload: Bytes,
}

impl InboundEnvelope {
    pub fn is_direct(&self) -> bool {
        self.channel == NONE_SENTINEL
    }
}

/// Byte-moving collaborator: multicast primitives plus reliable
/// point-to-point delivery. Implementations stamp sender identity and
/// per-channel sequence numbers on outbound traffic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` on a multicast channel.
    async fn broadcast(&self, channel: ChannelHandle, tag: u32, payload: Bytes) -> Result<()>;

    /// Deliver `payload` point-to-point to one instance.
    async fn send_direct(&self, to: InstanceId, tag: u32, payload: Bytes) -> Result<()>;

    /// Open (or look up) the multicast channel for a group key.
    async fn open_channel(&self, group_key: &str) -> Result<ChannelHandle>;

    /// Start receiving `(channel, tag)` traffic.
    async fn subscribe(&self, channel: ChannelHandle, tag: u32) -> Result<()>;

    /// Stop receiving `(channel, tag)` traffic.
    async fn cancel_subscribe(&self, channel: ChannelHandle, tag: u32) -> Result<()>;
}
