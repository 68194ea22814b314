//! Node mobility.
//!
//! A moving node periodically switches to the next set of locators in its [`LocatorCycle`]. A
//! handover is soft: the new locators are joined before the old ones are left, and the old ones
//! stay joined for a while so packets in flight still arrive. In that window, every peer with an
//! active session is sent the new locators, until it acknowledges them or the retries run out.

use std::{fmt, str::FromStr, time::Duration};

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    config::NetworkConfig,
    identifier::{IdentifierParseError, Locator},
    link::Link,
    network::Network,
};

/// Separates locator sets in the textual form of a [`LocatorCycle`].
const SET_SEPARATOR: char = '-';
/// Separates locators in a set.
const LOCATOR_SEPARATOR: char = ',';

/// The locator sets a node moves through, in order. After the last set the node moves back to
/// the first one.
///
/// The textual form separates sets with `-` and locators in a set with `,`, e.g.
/// `0:0:0:a,0:0:0:b-0:0:0:c` is a node attached to `a` and `b`, which moves to `c` and back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct LocatorCycle {
    sets: Vec<Vec<Locator>>,
}

impl LocatorCycle {
    pub fn sets(&self) -> &[Vec<Locator>] {
        &self.sets
    }

    /// The set a node starts on.
    pub fn first(&self) -> &[Locator] {
        self.sets.first().map(Vec::as_slice).unwrap_or_default()
    }

    /// Checks if there is more than one set to move between.
    pub fn is_moving(&self) -> bool {
        self.sets.len() > 1
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl FromStr for LocatorCycle {
    type Err = IdentifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sets = s
            .split(SET_SEPARATOR)
            .map(|set| {
                set.split(LOCATOR_SEPARATOR)
                    .map(str::parse)
                    .collect::<Result<Vec<Locator>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sets })
    }
}

impl TryFrom<String> for LocatorCycle {
    type Error = IdentifierParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for LocatorCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, set) in self.sets.iter().enumerate() {
            if i > 0 {
                write!(f, "{SET_SEPARATOR}")?;
            }
            for (j, locator) in set.iter().enumerate() {
                if j > 0 {
                    write!(f, "{LOCATOR_SEPARATOR}")?;
                }
                write!(f, "{locator}")?;
            }
        }
        Ok(())
    }
}

/// Timing of handovers.
#[derive(Debug, Clone, Copy)]
pub struct HandoverSettings {
    pub move_interval: Duration,
    pub handover_time: Duration,
    pub locator_update_timeout: Duration,
    pub locator_update_retries: u32,
}

impl From<&NetworkConfig> for HandoverSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            move_interval: config.move_interval,
            handover_time: config.handover_time,
            locator_update_timeout: config.locator_update_timeout,
            locator_update_retries: config.locator_update_retries,
        }
    }
}

/// Move through the locator cycle forever. The node is expected to be attached to the first set
/// of the cycle when this starts.
pub async fn move_loop<L: Link>(
    network: Network<L>,
    cycle: LocatorCycle,
    settings: HandoverSettings,
) {
    if !cycle.is_moving() {
        return;
    }

    let mut ticker = tokio::time::interval(settings.move_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    for next in cycle.sets().iter().cycle().skip(1) {
        ticker.tick().await;
        handover(&network, next, &settings).await;
    }
}

/// Move the node to a new set of locators.
pub async fn handover<L: Link>(
    network: &Network<L>,
    next: &[Locator],
    settings: &HandoverSettings,
) {
    let start = Instant::now();
    let previous = network.locators();
    info!("Moving from {previous:?} to {next:?}");

    network.publish_locators(next.to_vec());
    let peers = network.begin_handover(start);
    debug!("Updating {peers} active peers");

    let joined = network.joined();
    for locator in next.iter().filter(|l| !joined.contains(l)) {
        if let Err(e) = network.join(*locator) {
            warn!("Could not join {locator}: {e}");
            continue;
        }
        if let Err(e) = network.advertise_on(*locator) {
            warn!("Could not advertise on {locator}: {e}");
        }
    }

    let mut acknowledged = peers == 0;
    for attempt in 0..=settings.locator_update_retries {
        if acknowledged {
            break;
        }
        if attempt > 0 {
            debug!(
                "Resending locator update to {} peers, attempt {attempt}",
                network.pending_acks()
            );
        }
        network.send_locator_updates(next);
        acknowledged = network
            .wait_for_acks(settings.locator_update_timeout)
            .await;
    }
    if !acknowledged {
        warn!(
            "{} peers did not acknowledge the locator update",
            network.pending_acks()
        );
    }

    tokio::time::sleep_until(start + settings.handover_time).await;

    network.finish_handover(next);
    for locator in network.joined().into_iter().filter(|l| !next.contains(l)) {
        if let Err(e) = network.leave(locator) {
            warn!("Could not leave {locator}: {e}");
        }
    }
    info!("Moved to {next:?}");
}
