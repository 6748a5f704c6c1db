//! UDP hole punching.
//!
//! Both peers send DIAL datagrams to each other's contact. The first DIAL that
//! arrives from the peer proves the path works in both directions; each side
//! then confirms with the server and gets its socket back once both did.

use crate::client::{resolve, Client};
use crate::error::{Error, Result};
use crate::proto::Message;
use crate::AbortOnDrop;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::UdpSocket,
    task,
    time::{interval, timeout},
};

pub const DIAL_INTERVAL: Duration = Duration::from_secs(1);

/// External ports two rendezvous servers saw for the same UDP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatCheck {
    pub first: u16,
    pub second: u16,
}

impl NatCheck {
    /// The NAT kept one mapping for both destinations, so peers can reach the
    /// port the server observed.
    pub fn supported(&self) -> bool {
        self.first == self.second
    }
}

/// Bind a non-blocking UDP socket that other sockets may share the port with.
pub fn bind(local_addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match local_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local_addr.into())?;

    UdpSocket::from_std(socket.into())
}

impl Client {
    /// Punch a UDP path to the paired peer.
    ///
    /// Returns the datagram socket, no longer read by the client, and the
    /// peer's address on it.
    pub async fn dial_udp(&mut self) -> Result<(UdpSocket, SocketAddr)> {
        let info = self
            .info
            .ok_or_else(|| Error::InvalidArgument("not paired".into()))?;
        let peer = info.peer.socket_addr();

        match timeout(self.config.dial_timeout, self.punch_udp(peer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::DialTimeout),
        }

        log::debug!("udp path to {} confirmed", peer);
        Ok((self.take_datagram_socket().await?, peer))
    }

    async fn punch_udp(&mut self, peer: SocketAddr) -> Result<()> {
        let socket = self.datagram_socket()?;
        let every = self.config.dial_interval;
        let dialer = AbortOnDrop(task::spawn(Self::send_dials(socket, peer, every)));

        let res = match self.wait_dial(peer).await {
            Ok(()) => self.confirm_dialed().await,
            Err(e) => Err(e),
        };

        dialer.cancel().await;
        res
    }

    async fn wait_dial(&mut self, peer: SocketAddr) -> Result<()> {
        let dials = &mut self.datagram.as_mut().ok_or(Error::Closed)?.dials;

        loop {
            match dials.recv().await {
                Some(src) if src == peer => {
                    log::debug!("dial from {}", peer);
                    return Ok(());
                }
                Some(src) => log::debug!("ignoring dial from {}, expecting {}", src, peer),
                None => return Err(Error::Closed),
            }
        }
    }

    async fn send_dials(socket: Arc<UdpSocket>, peer: SocketAddr, every: Duration) {
        let buf = match Message::dial().encode() {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("encode dial failed: {}", e);
                return;
            }
        };

        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            log::trace!("dial {}", peer);
            if let Err(e) = socket.send_to(&buf, peer).await {
                log::debug!("dial {} failed: {}", peer, e);
            }
        }
    }

    /// Check whether this network allows UDP hole punching.
    ///
    /// One socket asks both servers for the port it was seen from.
    pub async fn check_nat(first: &str, second: &str) -> Result<NatCheck> {
        let first_addr = resolve(first).await?;
        let second_addr = resolve(second).await?;
        if first_addr == second_addr {
            return Err(Error::InvalidArgument(
                "Must specify 2 different server addresses".into(),
            ));
        }

        let socket = bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
        let mut client = Client::on_socket(first_addr, socket)?;
        let first_port = client.request_port().await?;

        let socket = client.into_datagram_socket().await?;
        let mut client = Client::on_socket(second_addr, socket)?;
        let second_port = client.request_port().await?;
        client.close().await;

        let check = NatCheck {
            first: first_port,
            second: second_port,
        };
        log::debug!(
            "{} saw port {}, {} saw port {}",
            first_addr,
            first_port,
            second_addr,
            second_port
        );
        Ok(check)
    }

    /// Stop reading the datagram socket and hand it back.
    pub async fn into_datagram_socket(mut self) -> Result<UdpSocket> {
        self.take_datagram_socket().await
    }

    async fn take_datagram_socket(&mut self) -> Result<UdpSocket> {
        let datagram = self.datagram.take().ok_or(Error::Closed)?;
        datagram.reader.cancel().await;

        Arc::try_unwrap(datagram.socket).map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "datagram socket still in use",
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_shared_port() {
        let local_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
        let socket = bind(local_addr).unwrap();
        let port = socket.local_addr().unwrap().port();

        let remote = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        socket.connect(remote.local_addr().unwrap()).await.unwrap();

        let socket2 = bind((Ipv4Addr::LOCALHOST, port).into()).unwrap();
        socket2
            .send_to(b"hello", remote.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0; 16];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), port);
    }
}
