//! Locator update messages, sent by a moving node to its active peers.
//!
//! ```text
//! | flag (1 byte) | locator (8 bytes) * N |
//! ```
//!
//! A flag of 1 marks an advertisement carrying the new locator set of the sender. A flag of 0
//! marks the acknowledgement of an advertisement, which has no locators.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use crate::identifier::Locator;

const ADVERTISEMENT_FLAG: u8 = 1;
const ACKNOWLEDGEMENT_FLAG: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorUpdate {
    /// The sender is now reachable on these locators only.
    Advertisement(Vec<Locator>),
    /// The receiver processed the advertisement.
    Acknowledgement,
}

impl LocatorUpdate {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Advertisement(locators) => {
                let mut buf = BytesMut::with_capacity(1 + locators.len() * Locator::BYTE_SIZE);
                buf.put_u8(ADVERTISEMENT_FLAG);
                for locator in locators {
                    buf.put_u64(locator.value());
                }
                buf.freeze()
            }
            Self::Acknowledgement => Bytes::from_static(&[ACKNOWLEDGEMENT_FLAG]),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, io::Error> {
        let Some((flag, body)) = data.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty locator update",
            ));
        };

        match *flag {
            ADVERTISEMENT_FLAG => {
                if body.len() % Locator::BYTE_SIZE != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "locator list is not a multiple of the locator size",
                    ));
                }
                Ok(Self::Advertisement(
                    body.chunks_exact(Locator::BYTE_SIZE)
                        .map(|chunk| {
                            Locator::from(
                                <[u8; Locator::BYTE_SIZE]>::try_from(chunk)
                                    .expect("Chunks have the exact size of a locator; qed"),
                            )
                        })
                        .collect(),
                ))
            }
            ACKNOWLEDGEMENT_FLAG => Ok(Self::Acknowledgement),
            flag => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid locator update flag {flag}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LocatorUpdate;
    use crate::identifier::Locator;

    #[test]
    fn advertisement_layout() {
        let update = LocatorUpdate::Advertisement(vec![Locator::new(0xa), Locator::new(0xb)]);
        let raw = update.to_bytes();

        assert_eq!(raw.len(), 17);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[1..9], [0, 0, 0, 0, 0, 0, 0, 0xa]);
        assert_eq!(LocatorUpdate::from_bytes(&raw).expect("Valid update"), update);
    }

    #[test]
    fn acknowledgement_layout() {
        let raw = LocatorUpdate::Acknowledgement.to_bytes();
        assert_eq!(&raw[..], &[0]);
        assert_eq!(
            LocatorUpdate::from_bytes(&raw).expect("Valid ack"),
            LocatorUpdate::Acknowledgement
        );
    }

    #[test]
    fn reject_malformed() {
        assert!(LocatorUpdate::from_bytes(&[]).is_err());
        assert!(LocatorUpdate::from_bytes(&[2]).is_err());
        assert!(LocatorUpdate::from_bytes(&[1, 0, 0, 0]).is_err());
    }
}
