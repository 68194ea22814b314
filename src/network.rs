//! The network layer.
//!
//! Packets are addressed by an [`Ilv`]. To send a packet, the locator of the destination is
//! mapped to an interface (a joined locator) with the forwarding table, and the packet is sent on
//! the link of that interface. Every node on that link receives it. A node which is not the
//! destination forwards it if it knows a better interface, so packets can cross multiple links.
//!
//! Received packets are dispatched on their next header value: discovery and locator update
//! packets are handled internally, every other protocol is queued until a reader takes it.
//!
//! All mutable state lives in a single [`State`] behind a mutex. The lock is only held for table
//! lookups and updates, never while waiting on the link or on a timer.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Notify,
    },
    time::Instant,
};

use crate::{
    config::{DiscoveryConfig, NetworkConfig},
    discovery::{Discovery, NoMapping},
    forwarding::ForwardingTable,
    identifier::{Ilv, Locator, Nid},
    link::{Frame, Link, LinkError},
    locator_update::LocatorUpdate,
    packet::{Header, Packet, DISCOVERY_PROTOCOL, HEADER_SIZE, LOCATOR_UPDATE_PROTOCOL},
    queue::{Mailbox, QueueEmpty},
    session::SessionTable,
    task::TaskSet,
};

/// Destination of broadcast packets.
const ALL_NODES: Ilv = Ilv::new(Locator::ALL_NODES, Nid::UNSPECIFIED);

/// Errors returned when sending a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The forwarding table has no interface for the destination locator.
    #[error("no interface to locator {0}")]
    NoRoute(Locator),
    /// The packet does not fit in a single link message.
    #[error("packet too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
    /// The requested interface is not joined.
    #[error("not joined to interface {0}")]
    NotJoined(Locator),
    /// The background tasks of the network layer are gone.
    #[error("network layer stopped")]
    Stopped,
}

/// A packet received for a protocol without built in handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub payload: Bytes,
    pub src: Ilv,
    pub dst: Ilv,
    /// The locator the packet arrived on.
    pub interface: Locator,
}

struct Outbound {
    interface: Locator,
    packet: Packet,
}

struct State {
    /// Every locator the link is joined to.
    joined: BTreeSet<Locator>,
    /// The locators this node is reachable on. Only differs from `joined` during a handover.
    published: Vec<Locator>,
    forwarding: ForwardingTable,
    sessions: SessionTable,
    discovery: Discovery,
    /// Peers which did not yet acknowledge the current locator update, with the interface to
    /// reach them on.
    pending: HashMap<Ilv, Locator>,
}

struct Inner<L> {
    link: L,
    nid: Nid,
    hop_limit: u8,
    state: Mutex<State>,
    mailboxes: Mutex<HashMap<u8, Arc<Mailbox<Received>>>>,
    outbound: UnboundedSender<Outbound>,
    acks: Notify,
}

/// Handle to the network layer of a node.
pub struct Network<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for Network<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Link> Network<L> {
    /// Create the network layer on top of `link`, and join the initial locators.
    ///
    /// The send, receive and solicitation tasks are spawned on the current runtime, they stop
    /// when the returned [`TaskSet`] is dropped.
    pub fn new(
        link: L,
        nid: Nid,
        locators: Vec<Locator>,
        network: &NetworkConfig,
        discovery: &DiscoveryConfig,
    ) -> Result<(Self, TaskSet), LinkError> {
        let mut joined = BTreeSet::new();
        let mut forwarding = ForwardingTable::new(network.backwards_learning_ttl);
        for locator in &locators {
            if joined.contains(locator) {
                continue;
            }
            link.join(*locator)?;
            forwarding.insert_local(*locator);
            joined.insert(*locator);
        }

        let state = State {
            joined,
            published: locators.clone(),
            forwarding,
            sessions: SessionTable::new(network.active_session_ttl),
            discovery: Discovery::new(
                discovery.hostname.clone(),
                nid,
                discovery.wait_time,
                locators.clone(),
            ),
            pending: HashMap::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            link,
            nid,
            hop_limit: network.hop_limit,
            state: Mutex::new(state),
            mailboxes: Mutex::new(HashMap::new()),
            outbound: tx,
            acks: Notify::new(),
        });

        info!(
            "Network layer started for {} ({nid}) on {locators:?}",
            discovery.hostname
        );

        let mut tasks = TaskSet::new();
        tasks.spawn("send", send_loop(inner.clone(), rx));
        tasks.spawn("receive", receive_loop(inner.clone()));
        tasks.spawn("solicitation", solicit_loop(inner.clone()));

        Ok((Self { inner }, tasks))
    }

    /// The identifier of this node.
    pub fn nid(&self) -> Nid {
        self.inner.nid
    }

    /// The hostname this node advertises.
    pub fn hostname(&self) -> String {
        self.inner.state.lock().unwrap().discovery.hostname().to_string()
    }

    /// The locators this node is currently reachable on.
    pub fn locators(&self) -> Vec<Locator> {
        self.inner.state.lock().unwrap().published.clone()
    }

    /// The interface packets for `locator` are sent on, if any.
    pub fn map_locator_to_interface(&self, locator: Locator) -> Option<Locator> {
        self.inner
            .state
            .lock()
            .unwrap()
            .forwarding
            .lookup(locator, Instant::now())
    }

    /// Send a packet, on the interface the forwarding table selects for the destination.
    /// Returns the interface used.
    pub fn send(&self, dst: Ilv, next_header: u8, payload: Bytes) -> Result<Locator, SendError> {
        self.inner.send(None, dst, next_header, payload)
    }

    /// Send a packet on a specific interface. Returns the interface used.
    pub fn send_via(
        &self,
        interface: Locator,
        dst: Ilv,
        next_header: u8,
        payload: Bytes,
    ) -> Result<Locator, SendError> {
        self.inner.send(Some(interface), dst, next_header, payload)
    }

    /// Send a packet to every node on every interface. Returns the interfaces used.
    pub fn broadcast(&self, next_header: u8, payload: Bytes) -> Result<Vec<Locator>, SendError> {
        let interfaces = self.locators();
        for interface in &interfaces {
            self.inner
                .send(Some(*interface), ALL_NODES, next_header, payload.clone())?;
        }
        Ok(interfaces)
    }

    /// Wait for the next packet of a protocol.
    pub async fn receive(&self, protocol: u8) -> Received {
        self.inner.mailbox(protocol).pop().await
    }

    /// Take the next packet of a protocol, if there is one.
    pub fn try_receive(&self, protocol: u8) -> Result<Received, QueueEmpty> {
        self.inner.mailbox(protocol).try_pop()
    }

    /// Wait at most `timeout` for the next packet of a protocol.
    pub async fn receive_timeout(
        &self,
        protocol: u8,
        timeout: Duration,
    ) -> Result<Received, QueueEmpty> {
        self.inner.mailbox(protocol).pop_timeout(timeout).await
    }

    /// Broadcast a discovery solicitation on every interface.
    pub fn solicit(&self) {
        self.inner.solicit();
    }

    /// All addresses a hostname is known to be reachable on.
    pub fn getaddrinfo(&self, hostname: &str) -> Result<Vec<Ilv>, NoMapping> {
        self.inner
            .state
            .lock()
            .unwrap()
            .discovery
            .getaddrinfo(hostname)
    }

    /// All locators a node is known to be reachable on.
    pub fn get_locs(&self, nid: Nid) -> Result<Vec<Locator>, NoMapping> {
        self.inner.state.lock().unwrap().discovery.get_locs(nid)
    }

    /// The hostname of the node at an address.
    pub fn gethostbyaddr(&self, ilv: Ilv) -> Result<String, NoMapping> {
        self.inner.state.lock().unwrap().discovery.gethostbyaddr(ilv)
    }

    /// Every locator the link is currently joined to.
    pub(crate) fn joined(&self) -> Vec<Locator> {
        self.inner
            .state
            .lock()
            .unwrap()
            .joined
            .iter()
            .copied()
            .collect()
    }

    /// Join an additional locator.
    pub(crate) fn join(&self, locator: Locator) -> Result<(), LinkError> {
        self.inner.link.join(locator)?;
        let mut state = self.inner.state.lock().unwrap();
        state.joined.insert(locator);
        state.forwarding.insert_local(locator);
        Ok(())
    }

    /// Leave a joined locator.
    pub(crate) fn leave(&self, locator: Locator) -> Result<(), LinkError> {
        self.inner.link.leave(locator)?;
        self.inner.state.lock().unwrap().joined.remove(&locator);
        Ok(())
    }

    /// Change the locators this node is reachable on.
    pub(crate) fn publish_locators(&self, locators: Vec<Locator>) {
        let mut state = self.inner.state.lock().unwrap();
        state.discovery.set_local_locators(locators.clone());
        state.published = locators;
    }

    /// Broadcast a discovery advertisement on a single interface.
    pub(crate) fn advertise_on(&self, interface: Locator) -> Result<(), SendError> {
        let advert = self
            .inner
            .state
            .lock()
            .unwrap()
            .discovery
            .advertisement()
            .to_bytes();
        self.inner
            .send(Some(interface), ALL_NODES, DISCOVERY_PROTOCOL, advert)
            .map(|_| ())
    }

    /// Start tracking acknowledgements of every active peer. Returns the amount of peers.
    pub(crate) fn begin_handover(&self, now: Instant) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        state.pending.clear();
        for peer in state.sessions.active(now) {
            match state.forwarding.lookup(peer.locator, now) {
                Some(interface) => {
                    state.pending.insert(peer, interface);
                }
                None => debug!("No interface to active peer {peer}, not updating it"),
            }
        }
        state.pending.len()
    }

    /// Send a locator update advertisement to every peer which did not acknowledge yet.
    pub(crate) fn send_locator_updates(&self, locators: &[Locator]) {
        let payload = LocatorUpdate::Advertisement(locators.to_vec()).to_bytes();
        let pending = self
            .inner
            .state
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|(peer, interface)| (*peer, *interface))
            .collect::<Vec<_>>();
        for (peer, interface) in pending {
            trace!("Sending locator update to {peer} via {interface}");
            if let Err(e) =
                self.inner
                    .send(Some(interface), peer, LOCATOR_UPDATE_PROTOCOL, payload.clone())
            {
                warn!("Could not send locator update to {peer}: {e}");
            }
        }
    }

    /// Wait until every peer acknowledged the locator update, for at most `timeout`. Returns
    /// `true` if no acknowledgements are outstanding.
    pub(crate) async fn wait_for_acks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.acks.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_acks() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_acks() == 0;
            }
        }
    }

    pub(crate) fn pending_acks(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Drop all forwarding state for interfaces which are not in `locators` anymore.
    pub(crate) fn finish_handover(&self, locators: &[Locator]) {
        let mut state = self.inner.state.lock().unwrap();
        state.forwarding.retain_interfaces(locators);
        state.pending.clear();
    }
}

impl<L: Link> Inner<L> {
    fn mailbox(&self, protocol: u8) -> Arc<Mailbox<Received>> {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(protocol)
            .or_default()
            .clone()
    }

    fn packet(&self, interface: Locator, dst: Ilv, next_header: u8, payload: Bytes) -> Packet {
        Packet {
            header: Header {
                payload_length: payload.len() as u16,
                next_header,
                hop_limit: self.hop_limit,
                src_locator: interface,
                src_nid: self.nid,
                dst_locator: dst.locator,
                dst_nid: dst.nid,
            },
            payload,
        }
    }

    fn enqueue(&self, interface: Locator, packet: Packet) -> Result<(), SendError> {
        self.outbound
            .send(Outbound { interface, packet })
            .map_err(|_| SendError::Stopped)
    }

    fn send(
        &self,
        interface: Option<Locator>,
        dst: Ilv,
        next_header: u8,
        payload: Bytes,
    ) -> Result<Locator, SendError> {
        let max = self
            .link
            .buffer_size()
            .min(HEADER_SIZE + u16::MAX as usize);
        let len = HEADER_SIZE + payload.len();
        if len > max {
            return Err(SendError::PayloadTooLarge { len, max });
        }

        let now = Instant::now();
        let interface = {
            let mut state = self.state.lock().unwrap();
            let interface = match interface {
                Some(interface) if state.joined.contains(&interface) => interface,
                Some(interface) => return Err(SendError::NotJoined(interface)),
                None => state
                    .forwarding
                    .lookup(dst.locator, now)
                    .ok_or(SendError::NoRoute(dst.locator))?,
            };
            state.sessions.touch(dst, now);
            interface
        };

        self.enqueue(interface, self.packet(interface, dst, next_header, payload))?;

        Ok(interface)
    }

    fn solicit(&self) {
        let (solicitation, interfaces) = {
            let state = self.state.lock().unwrap();
            (
                state.discovery.solicitation().to_bytes(),
                state.published.clone(),
            )
        };
        for interface in interfaces {
            if let Err(e) = self.send(
                Some(interface),
                ALL_NODES,
                DISCOVERY_PROTOCOL,
                solicitation.clone(),
            ) {
                warn!("Could not send solicitation on {interface}: {e}");
            }
        }
    }

    /// Drop every expired entry of the forwarding, session and host tables.
    fn prune_expired(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.forwarding.prune_expired(now);
        state.sessions.prune_expired(now);
        state.discovery.prune_expired(now);
        trace!(
            "Tables swept, {} forwarding entries, {} sessions, {} remote addresses left",
            state.forwarding.len(),
            state.sessions.len(),
            state.discovery.len()
        );
    }

    /// Process a single received frame.
    fn handle_frame(&self, frame: Frame) {
        let packet = match Packet::from_datagram(&frame.payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet from {}: {e}", frame.source);
                return;
            }
        };
        let header = packet.header;

        // Multicast loopback of our own packets. Packets to ourselves are still accepted.
        if header.dst_nid != self.nid
            && (frame.source == self.link.local_addr() || header.src_nid == self.nid)
        {
            trace!("Ignoring own packet on {}", frame.locator);
            return;
        }

        trace!(
            "{}/{} -> {}/{} on {}, next header {}, hop limit {}",
            header.src_locator,
            header.src_nid,
            header.dst_locator,
            header.dst_nid,
            frame.locator,
            header.next_header,
            header.hop_limit
        );

        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if !state.joined.contains(&header.src_locator) {
            state
                .forwarding
                .learn(header.src_locator, frame.locator, now);
        }

        if header.dst_nid != self.nid && !header.dst_locator.is_all_nodes() {
            self.forward(&mut state, frame.locator, packet, now);
            return;
        }

        match header.next_header {
            DISCOVERY_PROTOCOL => self.handle_discovery(&mut state, frame.locator, packet, now),
            LOCATOR_UPDATE_PROTOCOL => {
                self.handle_locator_update(&mut state, frame.locator, packet, now)
            }
            protocol => {
                let src = Ilv::new(header.src_locator, header.src_nid);
                state.sessions.touch(src, now);
                drop(state);

                let mailbox = self.mailbox(protocol);
                mailbox.push(Received {
                    payload: packet.payload,
                    src,
                    dst: Ilv::new(header.dst_locator, header.dst_nid),
                    interface: frame.locator,
                });
                trace!("Queued packet for protocol {protocol}, {} waiting", mailbox.len());
            }
        }
    }

    fn forward(&self, state: &mut State, arrival: Locator, packet: Packet, now: Instant) {
        let header = packet.header;
        if arrival == header.dst_locator {
            // The destination is attached to the link this arrived on, it has seen it already.
            return;
        }
        if header.hop_limit <= 1 {
            debug!(
                "Hop limit reached for packet to {}/{}",
                header.dst_locator, header.dst_nid
            );
            return;
        }
        let Some(interface) = state.forwarding.lookup(header.dst_locator, now) else {
            debug!("No interface to {}, dropping packet", header.dst_locator);
            return;
        };
        if interface == arrival {
            debug!(
                "Not forwarding packet for {} back on {arrival}",
                header.dst_locator
            );
            return;
        }

        trace!(
            "Forwarding packet for {} from {arrival} to {interface}",
            header.dst_locator
        );
        let packet = Packet {
            header: Header {
                hop_limit: header.hop_limit - 1,
                ..header
            },
            payload: packet.payload,
        };
        if let Err(e) = self.enqueue(interface, packet) {
            error!("Could not forward packet: {e}");
        }
    }

    fn handle_discovery(&self, state: &mut State, arrival: Locator, packet: Packet, now: Instant) {
        let header = packet.header;
        let message = match state
            .discovery
            .process_message(&packet.payload, header.src_locator, now)
        {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed discovery message from {}: {e}", header.src_nid);
                return;
            }
        };

        if message.solicitation {
            state.discovery.record_solicitation(now);
            let advert = state.discovery.advertisement().to_bytes();
            for interface in &state.published {
                let packet = self.packet(*interface, ALL_NODES, DISCOVERY_PROTOCOL, advert.clone());
                if let Err(e) = self.enqueue(*interface, packet) {
                    error!("Could not send advertisement: {e}");
                }
            }
        }

        // Spread the message to the other links this node is attached to.
        if header.hop_limit > 1 {
            let header = Header {
                hop_limit: header.hop_limit - 1,
                ..header
            };
            for interface in state.published.iter().filter(|i| **i != arrival) {
                let packet = Packet {
                    header,
                    payload: packet.payload.clone(),
                };
                if let Err(e) = self.enqueue(*interface, packet) {
                    error!("Could not rebroadcast discovery message: {e}");
                }
            }
        }
    }

    fn handle_locator_update(
        &self,
        state: &mut State,
        arrival: Locator,
        packet: Packet,
        now: Instant,
    ) {
        let header = packet.header;
        match LocatorUpdate::from_bytes(&packet.payload) {
            Ok(LocatorUpdate::Advertisement(locators)) => {
                info!("Node {} moved to {locators:?}", header.src_nid);
                state
                    .discovery
                    .locator_update(header.src_nid, &locators, now);
                for locator in &locators {
                    state
                        .sessions
                        .touch(Ilv::new(*locator, header.src_nid), now);
                }

                let ack = self.packet(
                    arrival,
                    Ilv::new(header.src_locator, header.src_nid),
                    LOCATOR_UPDATE_PROTOCOL,
                    LocatorUpdate::Acknowledgement.to_bytes(),
                );
                if let Err(e) = self.enqueue(arrival, ack) {
                    error!("Could not acknowledge locator update: {e}");
                }
            }
            Ok(LocatorUpdate::Acknowledgement) => {
                debug!("Locator update acknowledged by {}", header.src_nid);
                state.pending.retain(|peer, _| peer.nid != header.src_nid);
                self.acks.notify_waiters();
            }
            Err(e) => {
                warn!("Dropping malformed locator update from {}: {e}", header.src_nid);
            }
        }
    }
}

async fn send_loop<L: Link>(inner: Arc<Inner<L>>, mut rx: UnboundedReceiver<Outbound>) {
    while let Some(Outbound { interface, packet }) = rx.recv().await {
        let data = packet.to_bytes();
        if let Err(e) = inner.link.send(interface, &data).await {
            warn!(
                "Could not send packet for {}/{} on {interface}: {e}",
                packet.header.dst_locator, packet.header.dst_nid
            );
        }
    }
}

async fn receive_loop<L: Link>(inner: Arc<Inner<L>>) {
    loop {
        match inner.link.recv().await {
            Ok(frame) => inner.handle_frame(frame),
            Err(e) => error!("Failed to receive from link: {e}"),
        }
    }
}

/// Solicit once at startup, then whenever nobody solicited for a while. Expired table entries
/// are swept on every wake up.
async fn solicit_loop<L: Link>(inner: Arc<Inner<L>>) {
    inner.solicit();

    loop {
        let wait = inner.state.lock().unwrap().discovery.wait_time();
        let delay = rand::thread_rng().gen_range(wait / 2..=wait);
        tokio::time::sleep(delay).await;

        let now = Instant::now();
        inner.prune_expired(now);

        let recent = inner
            .state
            .lock()
            .unwrap()
            .discovery
            .solicited_recently(now);
        if recent {
            trace!("Skipping solicitation, one was seen recently");
            continue;
        }
        inner.solicit();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::Instant;

    use super::{Network, SendError};
    use crate::{
        config::{DiscoveryConfig, NetworkConfig},
        discovery::DiscoveryMessage,
        identifier::{Ilv, Locator, Nid},
        link::{
            memory::{Hub, MemoryLink},
            Link,
        },
        packet::{Header, Packet, DISCOVERY_PROTOCOL},
        task::TaskSet,
    };

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn node(
        hub: &Hub,
        nid: u64,
        hostname: &str,
        locators: &[Locator],
    ) -> (Network<MemoryLink>, TaskSet) {
        Network::new(
            hub.link(1500),
            Nid::new(nid),
            locators.to_vec(),
            &NetworkConfig::default(),
            &DiscoveryConfig {
                hostname: hostname.into(),
                wait_time: Duration::from_secs(60),
            },
        )
        .expect("Can join locators")
    }

    /// Wait for a packet of a given protocol on a raw link.
    async fn next_packet(link: &MemoryLink, next_header: u8) -> Packet {
        loop {
            let frame = link.recv().await.expect("Hub is alive");
            let packet = Packet::from_datagram(&frame.payload).expect("Valid packet");
            if packet.header.next_header == next_header {
                return packet;
            }
        }
    }

    fn raw_packet(
        src: Ilv,
        dst: Ilv,
        next_header: u8,
        hop_limit: u8,
        payload: &'static [u8],
    ) -> Packet {
        Packet {
            header: Header {
                payload_length: payload.len() as u16,
                next_header,
                hop_limit,
                src_locator: src.locator,
                src_nid: src.nid,
                dst_locator: dst.locator,
                dst_nid: dst.nid,
            },
            payload: Bytes::from_static(payload),
        }
    }

    fn discovery_packet(src: Ilv, hostname: &str, solicitation: bool) -> Packet {
        let payload = DiscoveryMessage {
            nid: src.nid,
            solicitation,
            hostname: hostname.into(),
        }
        .to_bytes();
        Packet {
            header: Header {
                payload_length: payload.len() as u16,
                next_header: DISCOVERY_PROTOCOL,
                hop_limit: 32,
                src_locator: src.locator,
                src_nid: src.nid,
                dst_locator: Locator::ALL_NODES,
                dst_nid: Nid::UNSPECIFIED,
            },
            payload,
        }
    }

    #[tokio::test]
    async fn joined_locators_map_to_themselves() {
        let hub = Hub::new();
        let (a, b) = (Locator::new(0xa), Locator::new(0xb));
        let (network, _tasks) = node(&hub, 1, "a", &[a, b]);

        assert_eq!(network.map_locator_to_interface(a), Some(a));
        assert_eq!(network.map_locator_to_interface(b), Some(b));
        assert_eq!(network.map_locator_to_interface(Locator::new(0xc)), None);
    }

    #[tokio::test]
    async fn hello_between_two_nodes() {
        let hub = Hub::new();
        let loc: Locator = "0:0:0:a".parse().expect("Valid locator");
        let nid_a: Nid = "0:0:0:1".parse().expect("Valid nid");
        let nid_b: Nid = "0:0:0:2".parse().expect("Valid nid");
        let (a, _a_tasks) = node(&hub, nid_a.value(), "a", &[loc]);
        let (b, _b_tasks) = node(&hub, nid_b.value(), "b", &[loc]);

        let interface = a
            .send(Ilv::new(loc, nid_b), 99, Bytes::from_static(b"hello"))
            .expect("Route to joined locator");
        assert_eq!(interface, loc);

        let received = b
            .receive_timeout(99, TIMEOUT)
            .await
            .expect("Packet arrives");
        assert_eq!(&received.payload[..], b"hello");
        assert_eq!(received.src, Ilv::new(loc, nid_a));
        assert_eq!(received.dst, Ilv::new(loc, nid_b));
        assert_eq!(received.interface, loc);

        // The sender does not receive its own packet.
        assert!(a.try_receive(99).is_err());
    }

    #[tokio::test]
    async fn send_errors() {
        let hub = Hub::new();
        let loc = Locator::new(0xa);
        let (network, _tasks) = node(&hub, 1, "a", &[loc]);
        let dst = Ilv::new(loc, Nid::new(2));

        assert_eq!(
            network.send(Ilv::new(Locator::new(0xf), Nid::new(2)), 99, Bytes::new()),
            Err(SendError::NoRoute(Locator::new(0xf)))
        );
        assert_eq!(
            network.send_via(Locator::new(0xf), dst, 99, Bytes::new()),
            Err(SendError::NotJoined(Locator::new(0xf)))
        );
        assert!(network
            .send(dst, 99, Bytes::from(vec![0; 1500 - 40]))
            .is_ok());
        assert_eq!(
            network.send(dst, 99, Bytes::from(vec![0; 1500 - 39])),
            Err(SendError::PayloadTooLarge {
                len: 1501,
                max: 1500
            })
        );
    }

    #[tokio::test]
    async fn forwarding_decrements_hop_limit() {
        let hub = Hub::new();
        let (x, y) = (Locator::new(0xa), Locator::new(0xb));
        let (_router, _tasks) = node(&hub, 1, "router", &[x, y]);
        let input = hub.link(1500);
        let output = hub.link(1500);
        input.join(x).expect("Can join");
        output.join(y).expect("Can join");

        let src = Ilv::new(x, Nid::new(10));
        let dst = Ilv::new(y, Nid::new(20));
        let packet = raw_packet(src, dst, 99, 5, b"data");
        input
            .send(x, &packet.to_bytes())
            .await
            .expect("Can send");

        let forwarded = tokio::time::timeout(TIMEOUT, next_packet(&output, 99))
            .await
            .expect("Packet is forwarded");
        assert_eq!(forwarded.header.hop_limit, 4);
        assert_eq!(
            forwarded.header,
            Header {
                hop_limit: 4,
                ..packet.header
            }
        );
        assert_eq!(forwarded.payload, packet.payload);
    }

    #[tokio::test]
    async fn hop_limit_exhausted_is_not_forwarded() {
        let hub = Hub::new();
        let (x, y) = (Locator::new(0xa), Locator::new(0xb));
        let (_router, _tasks) = node(&hub, 1, "router", &[x, y]);
        let input = hub.link(1500);
        let output = hub.link(1500);
        input.join(x).expect("Can join");
        output.join(y).expect("Can join");

        let src = Ilv::new(x, Nid::new(10));
        for hop_limit in [0, 1] {
            let packet = raw_packet(src, Ilv::new(y, Nid::new(20)), 99, hop_limit, b"data");
            input.send(x, &packet.to_bytes()).await.expect("Can send");
        }
        // No mapping for this locator.
        let packet = raw_packet(src, Ilv::new(Locator::new(0xc), Nid::new(20)), 99, 5, b"data");
        input.send(x, &packet.to_bytes()).await.expect("Can send");

        assert!(
            tokio::time::timeout(Duration::from_millis(200), next_packet(&output, 99))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn solicitation_yields_one_advertisement() {
        let hub = Hub::new();
        let loc = Locator::new(0xa);
        let (network, _tasks) = node(&hub, 2, "fresh", &[loc]);
        let tester = hub.link(1500);
        tester.join(loc).expect("Can join");

        let packet = discovery_packet(Ilv::new(loc, Nid::new(9)), "tester", true);
        tester.send(loc, &packet.to_bytes()).await.expect("Can send");

        let mut adverts = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                let packet = next_packet(&tester, DISCOVERY_PROTOCOL).await;
                let message =
                    DiscoveryMessage::from_bytes(&packet.payload).expect("Valid discovery message");
                if !message.solicitation {
                    adverts.push((packet.header, message));
                }
            }
        })
        .await;

        assert_eq!(adverts.len(), 1);
        let (header, message) = &adverts[0];
        assert_eq!(header.src_nid, Nid::new(2));
        assert_eq!(header.src_locator, loc);
        assert!(header.dst_locator.is_all_nodes());
        assert_eq!(message.nid, Nid::new(2));
        assert_eq!(message.hostname, "fresh");

        assert_eq!(
            network.gethostbyaddr(Ilv::new(loc, Nid::new(9))),
            Ok("tester".to_string())
        );
    }

    #[tokio::test]
    async fn discovery_across_links() {
        let hub = Hub::new();
        let (x, y) = (Locator::new(0xa), Locator::new(0xb));
        let (a, _a_tasks) = node(&hub, 1, "a", &[x]);
        let (_router, _r_tasks) = node(&hub, 2, "router", &[x, y]);
        let (b, _b_tasks) = node(&hub, 3, "b", &[y]);

        // B's startup solicitation is spread to x by the router.
        let addrs = tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Ok(addrs) = a.getaddrinfo("b") {
                    return addrs;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Hostname is resolved");
        assert_eq!(addrs, vec![Ilv::new(y, Nid::new(3))]);
        assert_eq!(a.map_locator_to_interface(y), Some(x));

        a.send(addrs[0], 99, Bytes::from_static(b"across"))
            .expect("Route via the router");
        let received = b
            .receive_timeout(99, TIMEOUT)
            .await
            .expect("Packet is forwarded");
        assert_eq!(&received.payload[..], b"across");
        assert_eq!(received.src, Ilv::new(x, Nid::new(1)));
        assert_eq!(received.interface, y);
    }

    #[tokio::test(start_paused = true)]
    async fn frequent_solicitations_suppress_periodic_ones() {
        let hub = Hub::new();
        let loc = Locator::new(0xa);
        let (_network, _tasks) = Network::new(
            hub.link(1500),
            Nid::new(2),
            vec![loc],
            &NetworkConfig::default(),
            &DiscoveryConfig {
                hostname: "quiet".into(),
                wait_time: Duration::from_secs(1),
            },
        )
        .expect("Can join");
        let tester = hub.link(1500);
        tester.join(loc).expect("Can join");

        let solicitation = discovery_packet(Ilv::new(loc, Nid::new(9)), "tester", true).to_bytes();
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        let end = Instant::now() + Duration::from_secs(10);
        let mut sent = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(end) => break,
                _ = ticker.tick() => tester.send(loc, &solicitation).await.expect("Can send"),
                frame = tester.recv() => {
                    let frame = frame.expect("Hub is alive");
                    let packet = Packet::from_datagram(&frame.payload).expect("Valid packet");
                    if packet.header.src_nid != Nid::new(2)
                        || packet.header.next_header != DISCOVERY_PROTOCOL
                    {
                        continue;
                    }
                    let message = DiscoveryMessage::from_bytes(&packet.payload)
                        .expect("Valid discovery message");
                    if message.solicitation {
                        sent += 1;
                    }
                }
            }
        }

        // Only the solicitation sent at startup.
        assert_eq!(sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept() {
        let hub = Hub::new();
        let loc = Locator::new(0xa);
        let ttl = Duration::from_secs(2);
        let (network, _tasks) = Network::new(
            hub.link(1500),
            Nid::new(2),
            vec![loc],
            &NetworkConfig {
                backwards_learning_ttl: ttl,
                active_session_ttl: ttl,
                ..NetworkConfig::default()
            },
            &DiscoveryConfig {
                hostname: "sweeper".into(),
                wait_time: Duration::from_millis(500),
            },
        )
        .expect("Can join");
        let tester = hub.link(1500);
        tester.join(loc).expect("Can join");

        // A remote node behind another locator, talking to us via `loc`.
        let remote = Ilv::new(Locator::new(0xc), Nid::new(9));
        let advert = discovery_packet(remote, "remote", false);
        tester.send(loc, &advert.to_bytes()).await.expect("Can send");
        let data = raw_packet(remote, Ilv::new(loc, Nid::new(2)), 99, 32, b"data");
        tester.send(loc, &data.to_bytes()).await.expect("Can send");
        network
            .receive_timeout(99, TIMEOUT)
            .await
            .expect("Packet arrives");

        {
            let state = network.inner.state.lock().unwrap();
            assert_eq!(state.forwarding.len(), 2);
            assert_eq!(state.sessions.len(), 1);
            assert_eq!(state.discovery.len(), 1);
        }

        // Nothing refreshes the entries, and nothing looks them up.
        tokio::time::sleep(ttl * 3).await;

        let state = network.inner.state.lock().unwrap();
        assert_eq!(state.forwarding.len(), 1);
        assert_eq!(state.sessions.len(), 0);
        assert_eq!(state.discovery.len(), 0);
    }
}
