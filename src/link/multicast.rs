//! A [`Link`] on top of IPv6 multicast.
//!
//! A single UDP socket is bound to the configured port. Joining a locator joins the multicast
//! group derived from it on the configured interface. Since all groups share the socket, the
//! group a datagram was sent to is recovered from the `IPV6_PKTINFO` control message.

use std::{
    collections::HashSet,
    io::{self, IoSliceMut},
    net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6},
    os::fd::AsRawFd,
    sync::Mutex,
};

use bytes::Bytes;
use log::{debug, info, trace};
use nix::sys::socket::{
    recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn6,
};
use tokio::{io::Interest, net::UdpSocket};

use super::{check_size, locator_from_group, multicast_group, preview, Frame, Link, LinkError};
use crate::{config::LinkConfig, identifier::Locator};

/// A [`Link`] backed by IPv6 multicast on a single network interface.
pub struct MulticastLink {
    socket: UdpSocket,
    port: u16,
    interface: String,
    interface_index: u32,
    local_addr: Ipv6Addr,
    owner: u16,
    buffer_size: usize,
    joined: Mutex<HashSet<Locator>>,
}

impl MulticastLink {
    /// Bind the multicast socket described by the [`LinkConfig`].
    ///
    /// This must be called from within a tokio runtime.
    pub fn bind(config: &LinkConfig) -> Result<Self, LinkError> {
        let interface_index = nix::net::if_::if_nametoindex(config.mcast_interface.as_str())
            .map_err(io::Error::from)?;
        let local_addr = interface_address(&config.mcast_interface)?;

        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            config.mcast_port,
        ))?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        // Deliver the destination group of every datagram as ancillary data.
        setsockopt(&socket, sockopt::Ipv6RecvPacketInfo, &true).map_err(io::Error::from)?;
        // Other instances on this host must see our traffic, our own copies are filtered by the
        // network layer.
        socket.set_multicast_loop_v6(true)?;

        info!(
            "Bound multicast link on {} (index {}), local address {}, port {}",
            config.mcast_interface, interface_index, local_addr, config.mcast_port
        );

        Ok(Self {
            socket,
            port: config.mcast_port,
            interface: config.mcast_interface.clone(),
            interface_index,
            local_addr,
            owner: (nix::unistd::getuid().as_raw() % (u16::MAX as u32 + 1)) as u16,
            buffer_size: config.buffer_size,
            joined: Mutex::new(HashSet::new()),
        })
    }

    fn destination(&self, locator: Locator) -> SocketAddrV6 {
        SocketAddrV6::new(
            multicast_group(self.owner, locator),
            self.port,
            0,
            self.interface_index,
        )
    }

    /// Read a single datagram. Returns the amount of bytes read, the sender, and the destination
    /// group if packet info was present.
    fn recv_with_pktinfo(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, Option<Ipv6Addr>, Option<Ipv6Addr>)> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_space = nix::cmsg_space!(nix::libc::in6_pktinfo);
        let msg = recvmsg::<SockaddrIn6>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let group = msg.cmsgs().find_map(|cmsg| match cmsg {
            ControlMessageOwned::Ipv6PacketInfo(info) => {
                Some(Ipv6Addr::from(info.ipi6_addr.s6_addr))
            }
            _ => None,
        });

        Ok((msg.bytes, msg.address.map(|addr| addr.ip()), group))
    }
}

impl Link for MulticastLink {
    fn join(&self, locator: Locator) -> Result<(), LinkError> {
        let mut joined = self.joined.lock().unwrap();
        if joined.contains(&locator) {
            return Err(LinkError::AlreadyJoined(locator));
        }
        let group = multicast_group(self.owner, locator);
        self.socket
            .join_multicast_v6(&group, self.interface_index)?;
        joined.insert(locator);

        info!("Joined {}%{}", group, self.interface);
        Ok(())
    }

    fn leave(&self, locator: Locator) -> Result<(), LinkError> {
        let mut joined = self.joined.lock().unwrap();
        if !joined.contains(&locator) {
            return Err(LinkError::NotJoined(locator));
        }
        let group = multicast_group(self.owner, locator);
        self.socket
            .leave_multicast_v6(&group, self.interface_index)?;
        joined.remove(&locator);

        info!("Left {}%{}", group, self.interface);
        Ok(())
    }

    async fn send(&self, locator: Locator, payload: &[u8]) -> Result<(), LinkError> {
        if !self.joined.lock().unwrap().contains(&locator) {
            return Err(LinkError::NotJoined(locator));
        }
        check_size(payload.len(), self.buffer_size)?;

        let destination = self.destination(locator);
        self.socket.send_to(payload, destination).await?;

        trace!(
            "[{}]:{} <- [{}]:{} {}",
            destination.ip(),
            self.port,
            self.local_addr,
            self.port,
            preview(payload)
        );

        Ok(())
    }

    async fn recv(&self) -> Result<Frame, LinkError> {
        loop {
            let mut buf = vec![0; self.buffer_size];
            let (n, source, group) = self
                .socket
                .async_io(Interest::READABLE, || self.recv_with_pktinfo(&mut buf))
                .await?;
            buf.truncate(n);

            let group = group.ok_or(LinkError::MissingPacketInfo)?;
            let Some(locator) = locator_from_group(self.owner, group) else {
                debug!("Ignoring datagram sent to foreign group {group}");
                continue;
            };
            let Some(source) = source else {
                debug!("Ignoring datagram without source address");
                continue;
            };

            trace!(
                "[{}]:{} -> [{}]:{} {}",
                source,
                self.port,
                group,
                self.port,
                preview(&buf)
            );

            return Ok(Frame {
                payload: Bytes::from(buf),
                locator,
                source: IpAddr::V6(source),
            });
        }
    }

    fn local_addr(&self) -> IpAddr {
        IpAddr::V6(self.local_addr)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Find the IPv6 address of an interface, preferring the link local address since that is the
/// source address of link local multicast traffic.
fn interface_address(interface: &str) -> io::Result<Ipv6Addr> {
    let mut candidates = nix::ifaddrs::getifaddrs()
        .map_err(io::Error::from)?
        .filter(|ifaddr| ifaddr.interface_name == interface)
        .filter_map(|ifaddr| {
            ifaddr
                .address
                .and_then(|addr| addr.as_sockaddr_in6().map(|sin6| sin6.ip()))
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|ip| !is_link_local(ip));

    candidates.into_iter().next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no IPv6 address on interface {interface}"),
        )
    })
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}
