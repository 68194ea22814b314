//! Tracks the peers this node recently exchanged packets with.
//!
//! When the node moves, every active peer is told about the new locators.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::identifier::Ilv;

pub struct SessionTable {
    ttl: Duration,
    sessions: HashMap<Ilv, Instant>,
}

impl SessionTable {
    /// Create an empty table, sessions are idle after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: HashMap::new(),
        }
    }

    /// Mark a peer as active. Broadcasts are not sessions and are ignored.
    pub fn touch(&mut self, ilv: Ilv, now: Instant) {
        if ilv.locator.is_all_nodes() {
            return;
        }
        self.sessions.insert(ilv, now);
    }

    /// All sessions which are still active at `now`. Idle sessions are removed.
    pub fn active(&mut self, now: Instant) -> Vec<Ilv> {
        self.prune_expired(now);
        let mut active = self.sessions.keys().copied().collect::<Vec<_>>();
        active.sort();
        active
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Remove every idle session.
    pub fn prune_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.sessions
            .retain(|_, last| now.saturating_duration_since(*last) < ttl);
    }
}
