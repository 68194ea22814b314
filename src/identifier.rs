//! Identifiers used on the overlay.
//!
//! Both a [`Locator`] and a [`Nid`] are 64 bit values. Their textual representation is the same
//! as the lower half of an IPv6 address without `::` compression: four colon separated groups of
//! up to 4 hex digits, e.g. `ff02:0:0:1`. Leading zeroes in a group are not printed.

use core::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Amount of 16 bit groups in the textual form of an identifier.
const GROUPS: usize = 4;

/// Error returned when parsing a textual identifier fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierParseError {
    /// The text does not consist of exactly 4 colon separated groups.
    #[error("expected 4 colon separated groups, found {0}")]
    GroupCount(usize),
    /// A group is empty, longer than 4 characters, or not hexadecimal.
    #[error("invalid hex group '{0}'")]
    InvalidGroup(String),
}

fn parse_groups(s: &str) -> Result<u64, IdentifierParseError> {
    let groups = s.split(':').collect::<Vec<_>>();
    if groups.len() != GROUPS {
        return Err(IdentifierParseError::GroupCount(groups.len()));
    }

    let mut value = 0u64;
    for group in groups {
        if group.is_empty() || group.len() > 4 {
            return Err(IdentifierParseError::InvalidGroup(group.to_string()));
        }
        let part = u16::from_str_radix(group, 16)
            .map_err(|_| IdentifierParseError::InvalidGroup(group.to_string()))?;
        value = (value << 16) | part as u64;
    }

    Ok(value)
}

fn write_groups(value: u64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
        f,
        "{:x}:{:x}:{:x}:{:x}",
        (value >> 48) as u16,
        (value >> 32) as u16,
        (value >> 16) as u16,
        value as u16
    )
}

/// A `Locator` names a point of attachment to the network. In this overlay every locator is an
/// emulated link, backed by its own multicast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Locator(u64);

/// A `Nid` (node identifier) names a node, regardless of where it is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Nid(u64);

impl Locator {
    /// Size in bytes of a `Locator` on the wire.
    pub const BYTE_SIZE: usize = 8;

    /// Reserved locator addressing every node attached to the link a packet is sent on.
    pub const ALL_NODES: Locator = Locator(0xff02_0000_0000_0001);

    /// Create a new `Locator` from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value of this `Locator`.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Checks if this is the [`all nodes`](Self::ALL_NODES) locator.
    pub const fn is_all_nodes(&self) -> bool {
        self.0 == Self::ALL_NODES.0
    }

    /// The big endian wire representation of this `Locator`.
    pub const fn to_bytes(self) -> [u8; Self::BYTE_SIZE] {
        self.0.to_be_bytes()
    }
}

impl Nid {
    /// Size in bytes of a `Nid` on the wire.
    pub const BYTE_SIZE: usize = 8;

    /// Placeholder identifier, used when the identity of the destination does not matter (i.e.
    /// when sending to [`Locator::ALL_NODES`]).
    pub const UNSPECIFIED: Nid = Nid(0);

    /// Create a new `Nid` from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Generate a random `Nid`. No attempt is made to detect collisions.
    pub fn random() -> Self {
        loop {
            let nid = Self(rand::random());
            if nid != Self::UNSPECIFIED {
                return nid;
            }
        }
    }

    /// The raw value of this `Nid`.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The big endian wire representation of this `Nid`.
    pub const fn to_bytes(self) -> [u8; Self::BYTE_SIZE] {
        self.0.to_be_bytes()
    }
}

/// An identifier-locator vector: one path to reach a node at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ilv {
    pub locator: Locator,
    pub nid: Nid,
}

impl Ilv {
    /// Create a new `Ilv`.
    pub const fn new(locator: Locator, nid: Nid) -> Self {
        Self { locator, nid }
    }
}

impl From<[u8; Locator::BYTE_SIZE]> for Locator {
    fn from(bytes: [u8; Locator::BYTE_SIZE]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<[u8; Nid::BYTE_SIZE]> for Nid {
    fn from(bytes: [u8; Nid::BYTE_SIZE]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for Locator {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u64> for Nid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for Locator {
    type Err = IdentifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_groups(s.trim()).map(Self)
    }
}

impl FromStr for Nid {
    type Err = IdentifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_groups(s.trim()).map(Self)
    }
}

impl TryFrom<String> for Locator {
    type Error = IdentifierParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for Nid {
    type Error = IdentifierParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_groups(self.0, f)
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_groups(self.0, f)
    }
}

impl fmt::Display for Ilv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.locator, self.nid)
    }
}

#[cfg(test)]
mod tests {
    use super::{IdentifierParseError, Locator, Nid};

    #[test]
    fn parse_and_display() {
        let loc: Locator = "0:0:0:a".parse().expect("Valid locator");
        assert_eq!(loc.value(), 0xa);
        assert_eq!(loc.to_string(), "0:0:0:a");

        let nid: Nid = "dead:BEEF:0001:2".parse().expect("Valid nid");
        assert_eq!(nid.value(), 0xdead_beef_0001_0002);
        assert_eq!(nid.to_string(), "dead:beef:1:2");
    }

    #[test]
    fn all_nodes_locator() {
        let loc: Locator = "ff02:0:0:1".parse().expect("Valid locator");
        assert_eq!(loc, Locator::ALL_NODES);
        assert!(loc.is_all_nodes());
    }

    #[test]
    fn reject_malformed() {
        assert_eq!(
            "0:0:1".parse::<Locator>(),
            Err(IdentifierParseError::GroupCount(3))
        );
        assert_eq!(
            "0:0:0:12345".parse::<Locator>(),
            Err(IdentifierParseError::InvalidGroup("12345".into()))
        );
        assert_eq!(
            "0::0:1".parse::<Nid>(),
            Err(IdentifierParseError::InvalidGroup("".into()))
        );
        assert!("0:0:0:g".parse::<Nid>().is_err());
    }

    #[test]
    fn wire_bytes() {
        let loc = Locator::new(0x0102_0304_0506_0708);
        assert_eq!(loc.to_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Locator::from(loc.to_bytes()), loc);
    }

    #[test]
    fn random_nid_is_specified() {
        for _ in 0..64 {
            assert_ne!(Nid::random(), Nid::UNSPECIFIED);
        }
    }
}
