//! TCP hole punching by simultaneous open.
//!
//! Both peers reuse the local port of their control connection, so the NAT
//! mapping the server observed (shifted by the measured port delta) predicts
//! where the peer's connection will come from.

use crate::client::{port_from_body, Client, DialConfig};
use crate::error::{Error, Result};
use crate::framing::{write_message, FramedReader};
use crate::proto::{Message, MessageType, PortDelta};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::{
    io::split,
    net::{TcpListener, TcpSocket, TcpStream},
    time::{sleep, timeout, timeout_at, Instant},
};

/// Control connections opened to measure the port delta.
pub const PORT_SAMPLES: usize = 5;
pub const CONNECT_ATTEMPTS: usize = 10;
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const ATTEMPT_BACKOFF: Duration = Duration::from_secs(1);

/// Bind a TCP socket that may share its port with a listener and other connections.
pub fn bind(local_addr: SocketAddr) -> io::Result<TcpSocket> {
    let s = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    s.set_reuseaddr(true)?;
    #[cfg(unix)]
    s.set_reuseport(true)?;
    s.bind(local_addr)?;

    Ok(s)
}

impl Client {
    /// Measure how the NAT moves the external port between consecutive connections.
    pub async fn measure_port_delta(&mut self) -> Result<PortDelta> {
        let mut ports = Vec::with_capacity(PORT_SAMPLES);
        for _ in 0..PORT_SAMPLES {
            ports.push(self.probe_port().await?);
        }

        let delta = PortDelta::from_samples(&ports);
        log::debug!("observed ports {:?}, delta {:?}", ports, delta);
        self.port_delta = Some(delta);
        Ok(delta)
    }

    async fn probe_port(&self) -> Result<u16> {
        let probe = async {
            let (stream, _) = self.connect_stream().await?;
            let (r, mut w) = split(stream);
            write_message(&mut w, &Message::empty(MessageType::PortRequest, 0)).await?;

            let reply = FramedReader::new(r).next().await?.ok_or(Error::Closed)?;
            match reply.kind {
                MessageType::PortResponse => port_from_body(&reply.body),
                MessageType::Error => Err(Error::from_reason(&String::from_utf8_lossy(
                    &reply.body,
                ))),
                other => Err(Error::ProtocolViolation(format!(
                    "expected {} but got {}",
                    MessageType::PortResponse,
                    other
                ))),
            }
        };

        timeout(self.config.request_timeout, probe)
            .await
            .map_err(|_| Error::RequestTimeout)?
    }

    /// Open a TCP connection to the paired peer.
    ///
    /// The initiator connects; the other side listens, re-punching its own NAT
    /// each attempt, and only accepts a connection from the predicted address.
    pub async fn dial_tcp(&mut self) -> Result<TcpStream> {
        let info = self
            .info
            .ok_or_else(|| Error::InvalidArgument("not paired".into()))?;

        let own_delta = self.port_delta.unwrap_or(PortDelta::Fixed(0));
        let peer_delta = match (own_delta, info.peer_port_delta) {
            (PortDelta::Fixed(_), PortDelta::Fixed(d)) => d,
            _ => return Err(Error::PortDeltaUnpredictable),
        };

        let expected = info.peer.offset(peer_delta).socket_addr();
        let local_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.local_addr.port()));
        log::debug!(
            "tcp dial {} -> {} as {}",
            local_addr,
            expected,
            if info.initiator { "initiator" } else { "listener" }
        );

        let stream = match info.initiator {
            true => connect_loop(local_addr, expected, &self.config).await?,
            false => accept_loop(local_addr, expected, &self.config).await?,
        };

        timeout(self.config.dial_timeout, self.confirm_dialed())
            .await
            .map_err(|_| Error::DialTimeout)??;

        Ok(stream)
    }
}

async fn connect_loop(
    local_addr: SocketAddr,
    peer: SocketAddr,
    config: &DialConfig,
) -> Result<TcpStream> {
    let attempts = config.connect_attempts;
    for attempt in 1..=attempts {
        let s = bind(local_addr)?;
        match timeout(config.attempt_timeout, s.connect(peer)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => log::debug!(
                "connect {} attempt {}/{} failed: {}",
                peer,
                attempt,
                attempts,
                e
            ),
            Err(_) => log::debug!(
                "connect {} attempt {}/{} timed out",
                peer,
                attempt,
                attempts
            ),
        }
        sleep(config.attempt_backoff).await;
    }

    Err(Error::ConnectionFailed)
}

async fn accept_loop(
    local_addr: SocketAddr,
    peer: SocketAddr,
    config: &DialConfig,
) -> Result<TcpStream> {
    let listener: TcpListener = bind(local_addr)?.listen(16)?;
    let attempts = config.connect_attempts;

    for attempt in 1..=attempts {
        punch(local_addr, peer).await;

        let deadline = Instant::now() + config.attempt_timeout;
        loop {
            match timeout_at(deadline, listener.accept()).await {
                Ok(Ok((stream, addr))) if addr == peer => return Ok(stream),
                Ok(Ok((_, addr))) => log::debug!("rejecting connection from {}", addr),
                Ok(Err(e)) => {
                    log::debug!("accept attempt {}/{} failed: {}", attempt, attempts, e);
                    break;
                }
                Err(_) => {
                    log::debug!("accept attempt {}/{} timed out", attempt, attempts);
                    break;
                }
            }
        }
    }

    Err(Error::ConnectionFailed)
}

// An outbound SYN opens our NAT for the peer; the connect itself is abandoned.
async fn punch(local_addr: SocketAddr, peer: SocketAddr) {
    if let Ok(s) = bind(local_addr) {
        log::trace!("punch {} -> {}", local_addr, peer);
        let _ = timeout(Duration::from_micros(1), s.connect(peer)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_from_shared_port() {
        let remote = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let first = bind((Ipv4Addr::LOCALHOST, 0).into())
            .unwrap()
            .connect(remote_addr)
            .await
            .unwrap();
        let local_addr = first.local_addr().unwrap();

        let remote2 = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let second = bind(local_addr)
            .unwrap()
            .connect(remote2.local_addr().unwrap())
            .await
            .unwrap();

        assert_eq!(second.local_addr().unwrap(), local_addr);
    }

    #[tokio::test]
    async fn test_listen_on_connected_port() {
        let remote = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let first = bind((Ipv4Addr::LOCALHOST, 0).into())
            .unwrap()
            .connect(remote.local_addr().unwrap())
            .await
            .unwrap();
        let local_addr = first.local_addr().unwrap();

        let listener = bind(local_addr).unwrap().listen(1).unwrap();
        let incoming = TcpStream::connect(local_addr).await.unwrap();
        let (_, from) = listener.accept().await.unwrap();

        assert_eq!(from, incoming.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_accept_filters_unexpected_peer() {
        let local_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
        let port = bind(local_addr).unwrap().local_addr().unwrap().port();
        let listen_addr: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();

        let expected = bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let expected_addr = expected.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            accept_loop(listen_addr, expected_addr, &DialConfig::default()).await
        });
        sleep(Duration::from_millis(100)).await;

        let _stranger = TcpStream::connect(listen_addr).await.unwrap();
        let _peer = expected.connect(listen_addr).await.unwrap();

        let stream = accept.await.unwrap().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), expected_addr);
    }

    fn short_budget() -> DialConfig {
        DialConfig {
            connect_attempts: 2,
            attempt_timeout: Duration::from_millis(200),
            attempt_backoff: Duration::from_millis(10),
            ..DialConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_budget_exhausted() {
        // bound but never listening, so every attempt is refused
        let closed = bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let peer = closed.local_addr().unwrap();

        let res = connect_loop((Ipv4Addr::LOCALHOST, 0).into(), peer, &short_budget()).await;
        assert!(matches!(res, Err(Error::ConnectionFailed)));
    }

    #[tokio::test]
    async fn test_accept_attempts_time_out() {
        let peer = bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let local_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
        let port = bind(local_addr).unwrap().local_addr().unwrap().port();

        let started = Instant::now();
        let res = accept_loop((Ipv4Addr::LOCALHOST, port).into(), peer_addr, &short_budget()).await;

        assert!(matches!(res, Err(Error::ConnectionFailed)));
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
