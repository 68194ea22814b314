//! The network layer packet format.
//!
//! Every packet starts with a fixed 40 byte header, laid out like an IPv6 header where the
//! source and destination addresses are split in a locator and a node identifier:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Version/Traffic class/Flow label (unused, always zero)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Payload length         |  Next header  |   Hop limit   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Source locator (64 bits)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Source NID (64 bits)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Destination locator (64 bits)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Destination NID (64 bits)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All values are big endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::identifier::{Locator, Nid};

/// Size of an encoded [`Header`].
pub const HEADER_SIZE: usize = 40;

/// Next header value of the transport protocol.
pub const TRANSPORT_PROTOCOL: u8 = 42;
/// Next header value of the discovery protocol.
pub const DISCOVERY_PROTOCOL: u8 = 43;
/// Next header value of the locator update protocol.
pub const LOCATOR_UPDATE_PROTOCOL: u8 = 44;

/// The fixed header of every network packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the payload following the header.
    pub payload_length: u16,
    /// Identifies the protocol of the payload.
    pub next_header: u8,
    /// Amount of hops this packet may still take.
    pub hop_limit: u8,
    pub src_locator: Locator,
    pub src_nid: Nid,
    pub dst_locator: Locator,
    pub dst_nid: Nid,
}

/// A [`Header`] and the payload it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Header {
    /// Write the encoded header to `dst`. Exactly [`HEADER_SIZE`] bytes are written.
    pub fn write_bytes(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(0);
        dst.put_u16(self.payload_length);
        dst.put_u8(self.next_header);
        dst.put_u8(self.hop_limit);
        dst.put_slice(&self.src_locator.to_bytes());
        dst.put_slice(&self.src_nid.to_bytes());
        dst.put_slice(&self.dst_locator.to_bytes());
        dst.put_slice(&self.dst_nid.to_bytes());
    }

    /// Read a header from the start of `src`.
    ///
    /// # Panics
    ///
    /// This function panics if `src` contains less than [`HEADER_SIZE`] bytes.
    pub fn from_bytes(src: &mut impl Buf) -> Self {
        // Version, traffic class and flow label are not used.
        src.advance(4);
        Self {
            payload_length: src.get_u16(),
            next_header: src.get_u8(),
            hop_limit: src.get_u8(),
            src_locator: src.get_u64().into(),
            src_nid: src.get_u64().into(),
            dst_locator: src.get_u64().into(),
            dst_nid: src.get_u64().into(),
        }
    }
}

impl Packet {
    /// Encode this packet into a single buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.write_bytes(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a packet from a complete datagram. Any bytes following the payload are ignored.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, std::io::Error> {
        let mut buf = BytesMut::from(datagram);
        match Codec::new().decode(&mut buf)? {
            Some(packet) => Ok(packet),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "datagram shorter than the packet it announces",
            )),
        }
    }
}

/// A decoder for network [`Packet`]s.
///
/// The decoder is used on whole datagrams, but also works on a stream of packets.
pub struct Codec {
    header: Option<Header>,
}

impl Codec {
    pub fn new() -> Self {
        Self { header: None }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = if let Some(header) = self.header.take() {
            header
        } else {
            if src.remaining() < HEADER_SIZE {
                return Ok(None);
            }
            Header::from_bytes(src)
        };

        let len = header.payload_length as usize;
        if src.remaining() < len {
            self.header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();

        Ok(Some(Packet { header, payload }))
    }
}
