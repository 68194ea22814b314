//! The link layer emulates a broadcast link per [`Locator`].
//!
//! Every locator is backed by a multicast group. Joining a locator means joining its group,
//! sending on a locator means sending to every node which joined the group, the sender included.
//! Received frames carry the locator they arrived on, and the raw address of the sender so the
//! network layer can recognize its own looped back traffic.

use std::{future::Future, io, net::IpAddr, net::Ipv6Addr};

use bytes::Bytes;

use crate::identifier::Locator;

pub mod memory;
#[cfg(target_os = "linux")]
pub mod multicast;

/// First 16 bits of every multicast group address. The `ff` prefix marks a multicast address,
/// flags are set to 1 (transient), and the scope is 2 (link local).
const MULTICAST_PREFIX: u16 = 0xff12;

/// Amount of payload bytes included in the hex preview of a logged frame.
const PREVIEW_SIZE: usize = 32;

/// Errors returned by a [`Link`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The locator is already joined.
    #[error("already joined locator {0}")]
    AlreadyJoined(Locator),
    /// The locator is not joined.
    #[error("not joined to locator {0}")]
    NotJoined(Locator),
    /// Messages are never fragmented or truncated, so a message which does not fit in the
    /// receive buffer of the peers can't be sent.
    #[error("message length larger than buffer size: {len} > {max}")]
    MessageTooLarge { len: usize, max: usize },
    /// A datagram was received without the packet info needed to find out which locator it
    /// arrived on.
    #[error("received datagram without IPv6 packet info")]
    MissingPacketInfo,
    /// Underlying I/O failure.
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A message received on a [`Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The raw message.
    pub payload: Bytes,
    /// The locator (i.e. multicast group) the message arrived on.
    pub locator: Locator,
    /// Raw address of the sender.
    pub source: IpAddr,
}

/// A broadcast medium, addressed by [`Locator`].
pub trait Link: Send + Sync + 'static {
    /// Join the group of a locator. Fails if the locator is already joined.
    fn join(&self, locator: Locator) -> Result<(), LinkError>;

    /// Leave the group of a locator. Fails if the locator is not joined.
    fn leave(&self, locator: Locator) -> Result<(), LinkError>;

    /// Send a message to every member of the group of the locator. Fails if the locator is not
    /// joined, or if the message is larger than [`buffer_size`](Link::buffer_size).
    fn send(
        &self,
        locator: Locator,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Wait for the next message on any joined locator.
    fn recv(&self) -> impl Future<Output = Result<Frame, LinkError>> + Send;

    /// The raw address frames sent from this link carry as source.
    fn local_addr(&self) -> IpAddr;

    /// The maximum size of a single message.
    fn buffer_size(&self) -> usize;
}

/// Check the size of an outgoing message against the buffer size of a link.
pub(crate) fn check_size(len: usize, max: usize) -> Result<(), LinkError> {
    if len > max {
        return Err(LinkError::MessageTooLarge { len, max });
    }
    Ok(())
}

/// Map a locator to the multicast group backing it.
///
/// The layout of the group address is:
///
/// ```text
/// | prefix (16) | unused (16) | unused (16) | owner (16) | locator (64) |
/// ```
///
/// The owner (i.e. the user id of the process) keeps instances of different users on the same
/// host from seeing each others traffic.
pub fn multicast_group(owner: u16, locator: Locator) -> Ipv6Addr {
    let loc = locator.value();
    Ipv6Addr::new(
        MULTICAST_PREFIX,
        0,
        0,
        owner,
        (loc >> 48) as u16,
        (loc >> 32) as u16,
        (loc >> 16) as u16,
        loc as u16,
    )
}

/// Extract the locator from a multicast group address. Returns [`None`] if the address is not a
/// group created by [`multicast_group`] for the given owner.
pub fn locator_from_group(owner: u16, group: Ipv6Addr) -> Option<Locator> {
    let segments = group.segments();
    if segments[0] != MULTICAST_PREFIX || segments[3] != owner {
        return None;
    }
    let octets = group.octets();
    Some(Locator::from(
        <[u8; Locator::BYTE_SIZE]>::try_from(&octets[8..16])
            .expect("Static slice bounds have the size of a locator; qed"),
    ))
}

/// Hex preview of the start of a payload, for logging.
pub(crate) fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(PREVIEW_SIZE);
    let mut out = faster_hex::hex_string(&payload[..end]);
    if payload.len() > PREVIEW_SIZE {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::{locator_from_group, multicast_group, preview, LinkError};
    use crate::identifier::Locator;

    #[test]
    fn group_layout() {
        let loc: Locator = "1:2:3:4".parse().expect("Valid locator");
        let group = multicast_group(1000, loc);
        assert_eq!(group, Ipv6Addr::new(0xff12, 0, 0, 1000, 1, 2, 3, 4));
        assert!(group.is_multicast());
        assert_eq!(locator_from_group(1000, group), Some(loc));
    }

    #[test]
    fn foreign_group_has_no_locator() {
        let loc = Locator::new(7);
        assert_eq!(locator_from_group(2, multicast_group(1, loc)), None);
        assert_eq!(locator_from_group(1, Ipv6Addr::LOCALHOST), None);
    }

    #[test]
    fn size_boundary() {
        assert!(super::check_size(1500, 1500).is_ok());
        assert!(matches!(
            super::check_size(1501, 1500),
            Err(LinkError::MessageTooLarge {
                len: 1501,
                max: 1500
            })
        ));
    }

    #[test]
    fn preview_is_truncated() {
        assert_eq!(preview(&[0xab, 0xcd]), "abcd");
        let long = [0u8; 40];
        let p = preview(&long);
        assert_eq!(p.len(), 64 + 2);
        assert!(p.ends_with(".."));
    }
}
