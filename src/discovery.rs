//! Name resolution on the overlay.
//!
//! Nodes announce their hostname and [`Nid`] with discovery messages. A solicitation asks every
//! receiver to announce itself, an advertisement is such an announcement. Since both are sent
//! with the packet header of the network layer, the receiver learns which locator the sender is
//! reachable on from the source locator of the packet.
//!
//! The message body is:
//!
//! ```text
//! | NID (8 bytes) | solicitation flag (1 byte) | UTF-8 hostname (rest of the datagram) |
//! ```
//!
//! The hostname is not length delimited, so a discovery message can never carry anything else.

use std::{
    collections::{HashMap, HashSet},
    io,
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use tokio::time::Instant;

use crate::identifier::{Ilv, Locator, Nid};

/// Size of the fixed part of a discovery message.
const FIXED_SIZE: usize = Nid::BYTE_SIZE + 1;

/// Mappings are valid for this many solicitation intervals.
const TTL_INTERVALS: u32 = 3;

/// Lookup failure, no valid mapping is known for the requested name or address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NoMapping {
    #[error("no mapping for hostname '{0}'")]
    Hostname(String),
    #[error("no mapping for nid {0}")]
    Nid(Nid),
    #[error("no mapping for address {0}")]
    Ilv(Ilv),
}

/// A solicitation or advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub nid: Nid,
    pub solicitation: bool,
    pub hostname: String,
}

impl DiscoveryMessage {
    /// Encode this message as a discovery packet payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_SIZE + self.hostname.len());
        buf.put_u64(self.nid.value());
        buf.put_u8(self.solicitation as u8);
        buf.put_slice(self.hostname.as_bytes());
        buf.freeze()
    }

    /// Decode a discovery packet payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, io::Error> {
        if data.len() < FIXED_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "discovery message too short",
            ));
        }
        let nid = Nid::from(
            <[u8; Nid::BYTE_SIZE]>::try_from(&data[..Nid::BYTE_SIZE])
                .expect("Length checked above; qed"),
        );
        let solicitation = match data[Nid::BYTE_SIZE] {
            0 => false,
            1 => true,
            flag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid solicitation flag {flag}"),
                ))
            }
        };
        let hostname = std::str::from_utf8(&data[FIXED_SIZE..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_string();

        Ok(Self {
            nid,
            solicitation,
            hostname,
        })
    }
}

/// The host mapping table.
///
/// Every mapping learned from the network is valid for 3 times the solicitation interval after
/// it was last refreshed. Expired mappings are evicted when they are looked up, or by an explicit
/// call to [`prune_expired`](Discovery::prune_expired). The local node is always known, and
/// resolves to the locators it currently joined.
pub struct Discovery {
    hostname: String,
    nid: Nid,
    wait_time: Duration,
    ttl: Duration,
    local_locators: Vec<Locator>,
    /// hostname -> addresses it was seen on.
    hosts: HashMap<String, HashMap<Ilv, Instant>>,
    /// address -> hostname seen on it.
    reverse: HashMap<Ilv, (String, Instant)>,
    last_solicitation: Option<Instant>,
}

impl Discovery {
    /// Create a new table for the local node.
    pub fn new(hostname: String, nid: Nid, wait_time: Duration, locators: Vec<Locator>) -> Self {
        Self {
            hostname,
            nid,
            wait_time,
            ttl: wait_time * TTL_INTERVALS,
            local_locators: locators,
            hosts: HashMap::new(),
            reverse: HashMap::new(),
            last_solicitation: None,
        }
    }

    /// The local hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Interval between periodic solicitations.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// The solicitation to broadcast for the local node.
    pub fn solicitation(&self) -> DiscoveryMessage {
        DiscoveryMessage {
            nid: self.nid,
            solicitation: true,
            hostname: self.hostname.clone(),
        }
    }

    /// The advertisement to broadcast for the local node.
    pub fn advertisement(&self) -> DiscoveryMessage {
        DiscoveryMessage {
            nid: self.nid,
            solicitation: false,
            hostname: self.hostname.clone(),
        }
    }

    /// Update the locators the local node resolves to.
    pub fn set_local_locators(&mut self, locators: Vec<Locator>) {
        self.local_locators = locators;
    }

    /// Process a received discovery message, sent from `locator`. The mapping of the sender is
    /// refreshed. The decoded message is returned, if it is a solicitation the caller should
    /// answer with an [`advertisement`](Self::advertisement).
    pub fn process_message(
        &mut self,
        data: &[u8],
        locator: Locator,
        now: Instant,
    ) -> Result<DiscoveryMessage, io::Error> {
        let message = DiscoveryMessage::from_bytes(data)?;
        if message.nid == self.nid {
            return Ok(message);
        }

        let ilv = Ilv::new(locator, message.nid);
        trace!(
            "{} {} is at {}",
            if message.solicitation {
                "Solicitation"
            } else {
                "Advertisement"
            },
            message.hostname,
            ilv
        );

        // An address belongs to a single host at a time.
        if let Some((previous, _)) = self.reverse.get(&ilv) {
            if *previous != message.hostname {
                if let Some(addrs) = self.hosts.get_mut(previous) {
                    addrs.remove(&ilv);
                }
            }
        }
        self.hosts
            .entry(message.hostname.clone())
            .or_default()
            .insert(ilv, now);
        self.reverse.insert(ilv, (message.hostname.clone(), now));

        Ok(message)
    }

    /// Remember that a solicitation was received or sent.
    pub fn record_solicitation(&mut self, now: Instant) {
        self.last_solicitation = Some(now);
    }

    /// Checks if a solicitation was seen less than `wait_time` ago.
    pub fn solicited_recently(&self, now: Instant) -> bool {
        self.last_solicitation
            .map(|at| now.saturating_duration_since(at) < self.wait_time)
            .unwrap_or(false)
    }

    /// All locators a node is known to be reachable on.
    pub fn get_locs(&mut self, nid: Nid) -> Result<Vec<Locator>, NoMapping> {
        if nid == self.nid {
            return Ok(self.local_locators.clone());
        }
        self.prune_expired(Instant::now());

        let mut locs = self
            .reverse
            .keys()
            .filter(|ilv| ilv.nid == nid)
            .map(|ilv| ilv.locator)
            .collect::<Vec<_>>();
        if locs.is_empty() {
            return Err(NoMapping::Nid(nid));
        }
        locs.sort();
        Ok(locs)
    }

    /// All addresses a hostname is known to be reachable on.
    pub fn getaddrinfo(&mut self, hostname: &str) -> Result<Vec<Ilv>, NoMapping> {
        if hostname == self.hostname {
            return Ok(self
                .local_locators
                .iter()
                .map(|loc| Ilv::new(*loc, self.nid))
                .collect());
        }

        let now = Instant::now();
        let ttl = self.ttl;
        let Some(addrs) = self.hosts.get_mut(hostname) else {
            return Err(NoMapping::Hostname(hostname.to_string()));
        };
        let mut expired = Vec::new();
        addrs.retain(|ilv, seen| {
            let valid = now.saturating_duration_since(*seen) < ttl;
            if !valid {
                expired.push(*ilv);
            }
            valid
        });
        let mut valid = addrs.keys().copied().collect::<Vec<_>>();
        if valid.is_empty() {
            self.hosts.remove(hostname);
        }
        for ilv in expired {
            self.reverse.remove(&ilv);
        }

        if valid.is_empty() {
            return Err(NoMapping::Hostname(hostname.to_string()));
        }
        valid.sort();
        Ok(valid)
    }

    /// The hostname of the node reachable at an address.
    pub fn gethostbyaddr(&mut self, ilv: Ilv) -> Result<String, NoMapping> {
        if ilv.nid == self.nid {
            return Ok(self.hostname.clone());
        }

        let ttl = self.ttl;
        match self.reverse.get(&ilv) {
            Some((hostname, seen)) if Instant::now().saturating_duration_since(*seen) < ttl => {
                Ok(hostname.clone())
            }
            Some((hostname, _)) => {
                let hostname = hostname.clone();
                self.forget(ilv, &hostname);
                Err(NoMapping::Ilv(ilv))
            }
            None => Err(NoMapping::Ilv(ilv)),
        }
    }

    /// Replace all locators of a node. Returns `false` if the node is unknown, in which case
    /// nothing changes, since the hostname of the node can't be derived.
    pub fn locator_update(&mut self, nid: Nid, locators: &[Locator], now: Instant) -> bool {
        let Some(hostname) = self
            .reverse
            .iter()
            .find(|(ilv, _)| ilv.nid == nid)
            .map(|(_, (hostname, _))| hostname.clone())
        else {
            debug!("Ignoring locator update of unknown node {nid}");
            return false;
        };

        let stale = self
            .reverse
            .keys()
            .filter(|ilv| ilv.nid == nid)
            .copied()
            .collect::<Vec<_>>();
        for ilv in stale {
            if let Some((host, _)) = self.reverse.remove(&ilv) {
                if let Some(addrs) = self.hosts.get_mut(&host) {
                    addrs.remove(&ilv);
                }
            }
        }

        let addrs = self.hosts.entry(hostname.clone()).or_default();
        for locator in locators.iter().collect::<HashSet<_>>() {
            let ilv = Ilv::new(*locator, nid);
            addrs.insert(ilv, now);
            self.reverse.insert(ilv, (hostname.clone(), now));
        }

        debug!("{hostname} ({nid}) moved to {locators:?}");
        true
    }

    /// Amount of known remote addresses.
    pub(crate) fn len(&self) -> usize {
        self.reverse.len()
    }

    /// Remove every mapping which is not valid anymore at `now`.
    pub fn prune_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.reverse
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < ttl);
        self.hosts.retain(|_, addrs| {
            addrs.retain(|_, seen| now.saturating_duration_since(*seen) < ttl);
            !addrs.is_empty()
        });
    }

    fn forget(&mut self, ilv: Ilv, hostname: &str) {
        self.reverse.remove(&ilv);
        if let Some(addrs) = self.hosts.get_mut(hostname) {
            addrs.remove(&ilv);
            if addrs.is_empty() {
                self.hosts.remove(hostname);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{Discovery, DiscoveryMessage, NoMapping};
    use crate::identifier::{Ilv, Locator, Nid};

    const WAIT: Duration = Duration::from_secs(1);

    fn discovery() -> Discovery {
        Discovery::new("local".into(), Nid::new(1), WAIT, vec![Locator::new(0xa)])
    }

    fn advert(nid: u64, hostname: &str) -> Vec<u8> {
        DiscoveryMessage {
            nid: Nid::new(nid),
            solicitation: false,
            hostname: hostname.into(),
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn message_layout() {
        let msg = DiscoveryMessage {
            nid: Nid::new(0x0102),
            solicitation: true,
            hostname: "host".into(),
        };
        let raw = msg.to_bytes();

        assert_eq!(raw[..9], [0, 0, 0, 0, 0, 0, 1, 2, 1]);
        assert_eq!(&raw[9..], b"host");
        assert_eq!(DiscoveryMessage::from_bytes(&raw).expect("Valid message"), msg);
    }

    #[test]
    fn reject_malformed_message() {
        assert!(DiscoveryMessage::from_bytes(&[0; 8]).is_err());
        assert!(DiscoveryMessage::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 1, 2]).is_err());
        assert!(DiscoveryMessage::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0xff]).is_err());
        // Empty hostname is fine.
        assert!(DiscoveryMessage::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 1, 0]).is_ok());
    }

    #[tokio::test]
    async fn learn_from_messages() {
        let mut d = discovery();
        let loc = Locator::new(0xb);

        let msg = d
            .process_message(&advert(2, "remote"), loc, Instant::now())
            .expect("Valid message");
        assert!(!msg.solicitation);

        assert_eq!(d.get_locs(Nid::new(2)), Ok(vec![loc]));
        assert_eq!(
            d.getaddrinfo("remote"),
            Ok(vec![Ilv::new(loc, Nid::new(2))])
        );
        assert_eq!(
            d.gethostbyaddr(Ilv::new(loc, Nid::new(2))),
            Ok("remote".to_string())
        );
        assert_eq!(d.get_locs(Nid::new(3)), Err(NoMapping::Nid(Nid::new(3))));
    }

    #[tokio::test]
    async fn local_node_always_resolves() {
        let mut d = discovery();
        assert_eq!(
            d.getaddrinfo("local"),
            Ok(vec![Ilv::new(Locator::new(0xa), Nid::new(1))])
        );

        d.set_local_locators(vec![Locator::new(0xc)]);
        assert_eq!(d.get_locs(Nid::new(1)), Ok(vec![Locator::new(0xc)]));
        assert_eq!(
            d.gethostbyaddr(Ilv::new(Locator::new(0xc), Nid::new(1))),
            Ok("local".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mappings_expire() {
        let mut d = discovery();
        d.process_message(&advert(2, "remote"), Locator::new(0xb), Instant::now())
            .expect("Valid message");

        tokio::time::advance(WAIT * 3 - Duration::from_millis(1)).await;
        assert!(d.get_locs(Nid::new(2)).is_ok());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(d.get_locs(Nid::new(2)), Err(NoMapping::Nid(Nid::new(2))));
        // Evicted, so a second lookup fails as well.
        assert_eq!(
            d.getaddrinfo("remote"),
            Err(NoMapping::Hostname("remote".into()))
        );
    }

    #[tokio::test]
    async fn prune_expired_is_explicit() {
        let mut d = discovery();
        let start = Instant::now();
        d.process_message(&advert(2, "remote"), Locator::new(0xb), start)
            .expect("Valid message");

        d.prune_expired(start + WAIT * 3);
        assert!(d.hosts.is_empty());
        assert!(d.reverse.is_empty());
    }

    #[tokio::test]
    async fn locator_update_replaces_all() {
        let mut d = discovery();
        let nid = Nid::new(2);
        d.process_message(&advert(2, "remote"), Locator::new(0xb), Instant::now())
            .expect("Valid message");
        d.process_message(&advert(2, "remote"), Locator::new(0xc), Instant::now())
            .expect("Valid message");

        let new = [Locator::new(0xd), Locator::new(0xe)];
        assert!(d.locator_update(nid, &new, Instant::now()));
        assert!(d.locator_update(nid, &new, Instant::now()));

        assert_eq!(d.get_locs(nid), Ok(new.to_vec()));
        assert_eq!(d.getaddrinfo("remote").map(|a| a.len()), Ok(2));
    }

    #[tokio::test]
    async fn locator_update_of_unknown_node() {
        let mut d = discovery();
        assert!(!d.locator_update(Nid::new(9), &[Locator::new(0xd)], Instant::now()));
        assert!(d.get_locs(Nid::new(9)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn solicitation_window() {
        let mut d = discovery();
        assert!(!d.solicited_recently(Instant::now()));

        d.record_solicitation(Instant::now());
        assert!(d.solicited_recently(Instant::now()));

        tokio::time::advance(WAIT).await;
        assert!(!d.solicited_recently(Instant::now()));
    }
}
