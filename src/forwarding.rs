//! Backwards learning forwarding table.
//!
//! Maps a destination locator to the interface (i.e. joined locator) to send packets for it on.
//! Every joined locator maps to itself and never expires. Other entries are learned from the
//! source locator of received packets, and expire after a fixed time.

use std::{collections::HashMap, time::Duration};

use log::debug;
use tokio::time::Instant;

use crate::identifier::Locator;

#[derive(Debug, Clone, Copy)]
struct Entry {
    interface: Locator,
    /// When the entry was learned, `None` for local entries.
    learned: Option<Instant>,
}

pub struct ForwardingTable {
    ttl: Duration,
    entries: HashMap<Locator, Entry>,
}

impl ForwardingTable {
    /// Create an empty table, learned entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Add a non expiring entry mapping a joined locator to itself.
    pub fn insert_local(&mut self, locator: Locator) {
        self.entries.insert(
            locator,
            Entry {
                interface: locator,
                learned: None,
            },
        );
    }

    /// Learn that `locator` is reachable via `interface`. Local entries are never overwritten.
    pub fn learn(&mut self, locator: Locator, interface: Locator, now: Instant) {
        match self.entries.get(&locator) {
            Some(Entry { learned: None, .. }) => return,
            Some(entry) if entry.interface == interface => {}
            _ => debug!("Learned {locator} via {interface}"),
        }
        self.entries.insert(
            locator,
            Entry {
                interface,
                learned: Some(now),
            },
        );
    }

    /// Find the interface to reach a locator on. An expired entry is removed.
    pub fn lookup(&mut self, locator: Locator, now: Instant) -> Option<Locator> {
        let entry = *self.entries.get(&locator)?;
        if self.is_expired(&entry, now) {
            debug!("Forwarding entry for {locator} expired");
            self.entries.remove(&locator);
            return None;
        }
        Some(entry.interface)
    }

    /// Remove every expired entry.
    pub fn prune_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| match entry.learned {
            Some(at) => now.saturating_duration_since(at) < ttl,
            None => true,
        });
    }

    /// Remove every entry, local or learned, whose interface is not one of `interfaces`.
    pub fn retain_interfaces(&mut self, interfaces: &[Locator]) {
        self.entries.retain(|locator, entry| {
            let keep = interfaces.contains(&entry.interface);
            if !keep {
                debug!("Dropping forwarding entry {locator} via {}", entry.interface);
            }
            keep
        });
    }

    /// Amount of entries, local ones included.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        entry
            .learned
            .map(|at| now.saturating_duration_since(at) >= self.ttl)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::ForwardingTable;
    use crate::identifier::Locator;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn local_entries_never_expire() {
        let mut table = ForwardingTable::new(TTL);
        let loc = Locator::new(0xa);
        let now = Instant::now();
        table.insert_local(loc);

        assert_eq!(table.lookup(loc, now), Some(loc));
        assert_eq!(table.lookup(loc, now + TTL * 100), Some(loc));

        // Learning can't move a joined locator to another interface.
        table.learn(loc, Locator::new(0xb), now);
        assert_eq!(table.lookup(loc, now), Some(loc));
    }

    #[test]
    fn learned_entries_expire() {
        let mut table = ForwardingTable::new(TTL);
        let remote = Locator::new(0xc);
        let iface = Locator::new(0xa);
        let now = Instant::now();
        table.learn(remote, iface, now);

        assert_eq!(table.lookup(remote, now + TTL - Duration::from_millis(1)), Some(iface));
        assert_eq!(table.lookup(remote, now + TTL), None);
        // Pruned by the first miss, so stays a miss.
        assert_eq!(table.lookup(remote, now), None);
    }

    #[test]
    fn relearning_refreshes() {
        let mut table = ForwardingTable::new(TTL);
        let remote = Locator::new(0xc);
        let iface = Locator::new(0xa);
        let now = Instant::now();
        table.learn(remote, iface, now);
        table.learn(remote, iface, now + TTL / 2);

        assert_eq!(table.lookup(remote, now + TTL), Some(iface));
    }

    #[test]
    fn prune_and_retain() {
        let mut table = ForwardingTable::new(TTL);
        let now = Instant::now();
        let (a, b) = (Locator::new(0xa), Locator::new(0xb));
        table.insert_local(a);
        table.insert_local(b);
        table.learn(Locator::new(1), a, now);
        table.learn(Locator::new(2), b, now);
        table.learn(Locator::new(3), a, now + TTL);

        table.prune_expired(now + TTL);
        assert_eq!(table.entries.len(), 3);

        table.retain_interfaces(&[b]);
        assert_eq!(table.lookup(b, now), Some(b));
        assert_eq!(table.lookup(a, now), None);
        assert_eq!(table.lookup(Locator::new(3), now + TTL), None);
        assert_eq!(table.entries.len(), 1);
    }
}
