//! A minimal transport protocol: ports on top of the network layer.
//!
//! Every transport packet starts with its ports, followed by the payload. In bidirectional mode
//! both ports are present so the receiver can reply:
//!
//! ```text
//! | source port (2 bytes) | destination port (2 bytes) | payload |
//! ```
//!
//! In connectionless mode only the destination port is present. Nodes must agree on the mode.
//! There is no connection state, no ordering and no retransmission.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::{
    config::TransportHeaderMode,
    discovery::NoMapping,
    identifier::{Ilv, Locator},
    link::Link,
    network::{self, Network, Received},
    packet::TRANSPORT_PROTOCOL,
    queue::{Mailbox, QueueEmpty},
    task::TaskSet,
};

/// Port used as source of packets sent from an unbound socket.
const UNBOUND_PORT: u16 = 0;

/// Error returned when binding a port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("port {0} is reserved for unbound sockets")]
    Reserved(u16),
}

/// Error returned when sending a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Resolve(#[from] NoMapping),
    #[error(transparent)]
    Network(#[from] network::SendError),
}

/// A datagram received on a [`Socket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    pub src: Ilv,
    /// Port of the sender, if the transport header carries it.
    pub src_port: Option<u16>,
    pub dst: Ilv,
    pub dst_port: u16,
    /// The locator the datagram arrived on.
    pub interface: Locator,
}

struct Inner<L> {
    network: Network<L>,
    mode: TransportHeaderMode,
    ports: Mutex<HashMap<u16, Arc<Mailbox<Datagram>>>>,
}

/// The transport layer of a node.
pub struct Transport<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for Transport<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Link> Transport<L> {
    /// Create the transport layer and spawn the task delivering received datagrams to sockets.
    pub fn new(network: Network<L>, mode: TransportHeaderMode) -> (Self, TaskSet) {
        let inner = Arc::new(Inner {
            network,
            mode,
            ports: Mutex::new(HashMap::new()),
        });

        let mut tasks = TaskSet::new();
        tasks.spawn("transport", demux_loop(inner.clone()));

        (Self { inner }, tasks)
    }

    /// Bind a socket to a port. The port is released when the socket is dropped.
    pub fn bind(&self, port: u16) -> Result<Socket<L>, BindError> {
        let mailbox = Arc::new(Mailbox::new());
        {
            let mut ports = self.inner.ports.lock().unwrap();
            if port == UNBOUND_PORT {
                return Err(BindError::Reserved(port));
            }
            if ports.contains_key(&port) {
                return Err(BindError::PortInUse(port));
            }
            ports.insert(port, mailbox.clone());
        }
        debug!("Bound port {port}");

        Ok(Socket {
            inner: self.inner.clone(),
            port: Some(port),
            mailbox,
        })
    }

    /// A socket which can only send. Nothing is ever received on it.
    pub fn unbound(&self) -> Socket<L> {
        Socket {
            inner: self.inner.clone(),
            port: None,
            mailbox: Arc::new(Mailbox::new()),
        }
    }
}

/// An endpoint of the transport layer.
pub struct Socket<L: Link> {
    inner: Arc<Inner<L>>,
    port: Option<u16>,
    mailbox: Arc<Mailbox<Datagram>>,
}

impl<L: Link> Socket<L> {
    /// The port this socket is bound to, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Send a datagram to a port on a node. Returns the interface it was sent on.
    pub fn send_to(&self, dst: Ilv, port: u16, payload: &[u8]) -> Result<Locator, SendError> {
        let header = TransportHeader {
            src_port: Some(self.port.unwrap_or(UNBOUND_PORT)),
            dst_port: port,
        };
        let data = header.encode(self.inner.mode, payload);
        Ok(self.inner.network.send(dst, TRANSPORT_PROTOCOL, data)?)
    }

    /// Send a datagram to a port on a named node. Every known address of the node is tried until
    /// one has a route. Returns the address used and the interface it was sent on.
    pub fn send_to_host(
        &self,
        hostname: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<(Ilv, Locator), SendError> {
        let addrs = self.inner.network.getaddrinfo(hostname)?;
        let mut last_err = None;
        for dst in addrs {
            match self.send_to(dst, port, payload) {
                Ok(interface) => return Ok((dst, interface)),
                Err(e) => {
                    trace!("Could not send to {hostname} at {dst}: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| NoMapping::Hostname(hostname.to_string()).into()))
    }

    /// Wait for the next datagram.
    pub async fn recv(&self) -> Datagram {
        self.mailbox.pop().await
    }

    /// Take the next datagram, if one is available.
    pub fn try_recv(&self) -> Result<Datagram, QueueEmpty> {
        self.mailbox.try_pop()
    }

    /// Wait at most `timeout` for the next datagram.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Datagram, QueueEmpty> {
        self.mailbox.pop_timeout(timeout).await
    }
}

impl<L: Link> Drop for Socket<L> {
    fn drop(&mut self) {
        if let Some(port) = self.port {
            self.inner.ports.lock().unwrap().remove(&port);
            debug!("Released port {port}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransportHeader {
    src_port: Option<u16>,
    dst_port: u16,
}

impl TransportHeader {
    fn size(mode: TransportHeaderMode) -> usize {
        match mode {
            TransportHeaderMode::Bidirectional => 4,
            TransportHeaderMode::Connectionless => 2,
        }
    }

    fn encode(&self, mode: TransportHeaderMode, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::size(mode) + payload.len());
        if mode == TransportHeaderMode::Bidirectional {
            buf.put_u16(self.src_port.unwrap_or(UNBOUND_PORT));
        }
        buf.put_u16(self.dst_port);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Split the header from a transport packet.
    fn decode(mode: TransportHeaderMode, mut data: Bytes) -> Result<(Self, Bytes), io::Error> {
        if data.len() < Self::size(mode) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "transport packet shorter than its header",
            ));
        }
        let src_port = match mode {
            TransportHeaderMode::Bidirectional => Some(data.get_u16()),
            TransportHeaderMode::Connectionless => None,
        };
        let dst_port = data.get_u16();

        Ok((Self { src_port, dst_port }, data))
    }
}

async fn demux_loop<L: Link>(inner: Arc<Inner<L>>) {
    loop {
        let received = inner.network.receive(TRANSPORT_PROTOCOL).await;
        inner.deliver(received);
    }
}

impl<L> Inner<L> {
    fn deliver(&self, received: Received) {
        let (header, payload) = match TransportHeader::decode(self.mode, received.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping malformed transport packet from {}: {e}", received.src);
                return;
            }
        };

        let mailbox = self.ports.lock().unwrap().get(&header.dst_port).cloned();
        let Some(mailbox) = mailbox else {
            debug!(
                "Dropping datagram from {} for unbound port {}",
                received.src, header.dst_port
            );
            return;
        };

        mailbox.push(Datagram {
            payload,
            src: received.src,
            src_port: header.src_port,
            dst: received.dst,
            dst_port: header.dst_port,
            interface: received.interface,
        });
    }
}
