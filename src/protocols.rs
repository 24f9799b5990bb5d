// SPDX-License-Identifier: Apache-2.0

//! Announcement wire format.
//!
//! Field order is fixed for interoperability: three length-prefixed strings
//! (app, version, release — wildcards carried as `*`), the sender's output
//! channel, then the identity this announcement responds to as
//! `(launch_id, rank)`. All integers are big-endian u32. Decode rejects
//! truncated input and trailing garbage; the caller logs and drops the
//! message.

use crate::identity::{AppTriplet, InstanceId, WILDCARD_STR};
use crate::registry::ChannelHandle;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Tag reserved for announcements on the discovery channel.
pub const ANNOUNCE_TAG: u32 = 0;

/// Largest accepted string field, to bound decode allocations.
const MAX_FIELD_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("announcement truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("string field of {len} bytes exceeds limit")]
    FieldTooLong { len: usize },
    #[error("string field is not valid utf-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
    #[error("{trailing} trailing bytes after announcement")]
    TrailingBytes { trailing: usize },
}

/// A broadcast by which a process advertises its triplet and output channel.
///
/// `in_response_to == InstanceId::NONE` marks an original announcement;
/// anything else is an echo addressed to the original asker and is never
/// echoed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub triplet: AppTriplet,
    pub output_channel: ChannelHandle,
    pub in_response_to: InstanceId,
}

impl Announcement {
    pub fn is_original(&self) -> bool {
        self.in_response_to.is_none()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_field(&mut buf, self.triplet.name.as_deref());
        put_field(&mut buf, self.triplet.version.as_deref());
        put_field(&mut buf, self.triplet.release.as_deref());
        buf.put_u32(self.output_channel);
        buf.put_u32(self.in_response_to.launch_id);
        buf.put_u32(self.in_response_to.rank);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, DecodeError> {
        let name = get_field(&mut bytes)?;
        let version = get_field(&mut bytes)?;
        let release = get_field(&mut bytes)?;
        let output_channel = get_u32(&mut bytes)?;
        let launch_id = get_u32(&mut bytes)?;
        let rank = get_u32(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(DecodeError::TrailingBytes {
                trailing: bytes.len(),
            });
        }
        Ok(Self {
            triplet: AppTriplet::new(name, version, release),
            output_channel,
            in_response_to: InstanceId::new(launch_id, rank),
        })
    }
}

fn put_field(buf: &mut BytesMut, field: Option<&str>) {
    let s = field.unwrap_or(WILDCARD_STR);
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_u32(bytes: &mut Bytes) -> Result<u32, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4 - bytes.len(),
        });
    }
    Ok(bytes.get_u32())
}

fn get_field(bytes: &mut Bytes) -> Result<Option<String>, DecodeError> {
    let len = get_u32(bytes)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(DecodeError::FieldTooLong { len });
    }
    if bytes.len() < len {
        return Err(DecodeError::Truncated {
            needed: len - bytes.len(),
        });
    }
    let raw = bytes.split_to(len);
    let s = String::from_utf8(raw.to_vec())?;
    Ok(if s == WILDCARD_STR { None } else { Some(s) })
}
