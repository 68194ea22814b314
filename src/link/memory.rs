//! An in-process [`Link`] implementation.
//!
//! A [`Hub`] plays the role of the multicast capable network. Every [`MemoryLink`] created from
//! it behaves like a socket on that network: frames sent on a locator are delivered to every link
//! which joined that locator, including the sender itself, just like multicast loopback.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv6Addr},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use log::trace;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{check_size, preview, Frame, Link, LinkError};
use crate::identifier::Locator;

/// Something which happened on a [`Hub`], in the order the hub observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A link joined a locator.
    Joined { link: IpAddr, locator: Locator },
    /// A link left a locator.
    Left { link: IpAddr, locator: Locator },
    /// A link sent a frame on a locator.
    Sent {
        link: IpAddr,
        locator: Locator,
        payload: Bytes,
    },
}

#[derive(Default)]
struct HubState {
    next_id: u16,
    groups: HashMap<Locator, HashMap<IpAddr, UnboundedSender<Frame>>>,
    taps: Vec<UnboundedSender<HubEvent>>,
}

impl HubState {
    fn emit(&mut self, event: HubEvent) {
        self.taps.retain(|tap| tap.send(event.clone()).is_ok());
    }
}

/// The shared medium for a set of [`MemoryLink`]s.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    /// Create a new, empty `Hub`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`MemoryLink`] attached to this `Hub`. Every link gets a unique link local
    /// address.
    pub fn link(&self, buffer_size: usize) -> MemoryLink {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let address = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, state.next_id));
        let (tx, rx) = mpsc::unbounded_channel();

        MemoryLink {
            address,
            buffer_size,
            hub: self.state.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            joined: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to everything happening on this `Hub` from now on.
    pub fn events(&self) -> UnboundedReceiver<HubEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().taps.push(tx);
        rx
    }
}

/// A [`Link`] on a [`Hub`].
pub struct MemoryLink {
    address: IpAddr,
    buffer_size: usize,
    hub: Arc<Mutex<HubState>>,
    tx: UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<UnboundedReceiver<Frame>>,
    joined: Mutex<HashSet<Locator>>,
}

impl Link for MemoryLink {
    fn join(&self, locator: Locator) -> Result<(), LinkError> {
        if !self.joined.lock().unwrap().insert(locator) {
            return Err(LinkError::AlreadyJoined(locator));
        }
        let mut hub = self.hub.lock().unwrap();
        hub.groups
            .entry(locator)
            .or_default()
            .insert(self.address, self.tx.clone());
        hub.emit(HubEvent::Joined {
            link: self.address,
            locator,
        });
        Ok(())
    }

    fn leave(&self, locator: Locator) -> Result<(), LinkError> {
        if !self.joined.lock().unwrap().remove(&locator) {
            return Err(LinkError::NotJoined(locator));
        }
        let mut hub = self.hub.lock().unwrap();
        if let Some(members) = hub.groups.get_mut(&locator) {
            members.remove(&self.address);
            if members.is_empty() {
                hub.groups.remove(&locator);
            }
        }
        hub.emit(HubEvent::Left {
            link: self.address,
            locator,
        });
        Ok(())
    }

    async fn send(&self, locator: Locator, payload: &[u8]) -> Result<(), LinkError> {
        if !self.joined.lock().unwrap().contains(&locator) {
            return Err(LinkError::NotJoined(locator));
        }
        check_size(payload.len(), self.buffer_size)?;

        trace!("{} <- {} {}", locator, self.address, preview(payload));

        let payload = Bytes::copy_from_slice(payload);
        let mut hub = self.hub.lock().unwrap();
        if let Some(members) = hub.groups.get(&locator) {
            for member in members.values() {
                // A member which is gone simply misses the frame, as on a real link.
                let _ = member.send(Frame {
                    payload: payload.clone(),
                    locator,
                    source: self.address,
                });
            }
        }
        hub.emit(HubEvent::Sent {
            link: self.address,
            locator,
            payload,
        });

        Ok(())
    }

    async fn recv(&self) -> Result<Frame, LinkError> {
        let frame = self.rx.lock().await.recv().await.ok_or_else(|| {
            LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory hub closed",
            ))
        })?;

        trace!("{} -> {} {}", frame.source, frame.locator, preview(&frame.payload));

        Ok(frame)
    }

    fn local_addr(&self) -> IpAddr {
        self.address
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        let joined = std::mem::take(&mut *self.joined.lock().unwrap());
        let mut hub = self.hub.lock().unwrap();
        for locator in joined {
            if let Some(members) = hub.groups.get_mut(&locator) {
                members.remove(&self.address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Hub, HubEvent};
    use crate::{
        identifier::Locator,
        link::{Link, LinkError},
    };

    #[tokio::test]
    async fn join_twice_fails() {
        let hub = Hub::new();
        let link = hub.link(64);
        let loc = Locator::new(1);

        link.join(loc).expect("First join succeeds");
        assert!(matches!(link.join(loc), Err(LinkError::AlreadyJoined(l)) if l == loc));
    }

    #[tokio::test]
    async fn leave_unjoined_fails() {
        let hub = Hub::new();
        let link = hub.link(64);
        assert!(matches!(
            link.leave(Locator::new(1)),
            Err(LinkError::NotJoined(_))
        ));
    }

    #[tokio::test]
    async fn send_requires_join() {
        let hub = Hub::new();
        let link = hub.link(64);
        assert!(matches!(
            link.send(Locator::new(1), b"data").await,
            Err(LinkError::NotJoined(_))
        ));
    }

    #[tokio::test]
    async fn buffer_size_boundary() {
        let hub = Hub::new();
        let link = hub.link(16);
        let loc = Locator::new(1);
        link.join(loc).expect("Can join");

        link.send(loc, &[0; 16])
            .await
            .expect("Message of exactly buffer size can be sent");
        assert!(matches!(
            link.send(loc, &[0; 17]).await,
            Err(LinkError::MessageTooLarge { len: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn delivery_to_members_only() {
        let hub = Hub::new();
        let a = hub.link(64);
        let b = hub.link(64);
        let c = hub.link(64);
        let shared = Locator::new(0xa);
        let other = Locator::new(0xb);

        a.join(shared).expect("Can join");
        b.join(shared).expect("Can join");
        c.join(other).expect("Can join");

        a.send(shared, b"hello").await.expect("Can send");

        let frame = b.recv().await.expect("Frame delivered to member");
        assert_eq!(&frame.payload[..], b"hello");
        assert_eq!(frame.locator, shared);
        assert_eq!(frame.source, a.local_addr());

        // Multicast loopback, the sender sees its own frame.
        let own = a.recv().await.expect("Frame looped back to sender");
        assert_eq!(own.source, a.local_addr());

        assert!(c.rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_are_ordered() {
        let hub = Hub::new();
        let mut events = hub.events();
        let a = hub.link(64);
        let loc = Locator::new(3);

        a.join(loc).expect("Can join");
        a.send(loc, b"x").await.expect("Can send");
        a.leave(loc).expect("Can leave");

        assert!(matches!(events.recv().await, Some(HubEvent::Joined { .. })));
        assert!(matches!(events.recv().await, Some(HubEvent::Sent { .. })));
        assert!(matches!(events.recv().await, Some(HubEvent::Left { .. })));
    }
}
