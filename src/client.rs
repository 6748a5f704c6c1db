//! Rendezvous client.
//!
//! A [`Client`] owns one session on the server. It correlates replies with
//! requests by nonce, pairs with a peer by id, then hands over to the UDP or
//! TCP traversal in [`crate::udp`] and [`crate::tcp`].

use crate::error::{Error, Result};
use crate::framing::{write_message, FramedReader};
use crate::proto::{
    InfoRequest, InfoResponse, Message, MessageType, PortDelta, Protocol, SessionId,
    BUFFER_LENGTH,
};
#[cfg(feature = "tls")]
use crate::tls;
use crate::{tcp, udp, AbortOnDrop};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{lookup_host, TcpStream, UdpSocket},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
    time::{interval_at, timeout, Instant},
};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Pairing waits for the peer to ask for us too.
pub const INFO_TIMEOUT: Duration = Duration::from_secs(60);
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts and retry budgets of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialConfig {
    pub request_timeout: Duration,
    pub info_timeout: Duration,
    /// Resend interval for requests sent as datagrams.
    pub retransmit_interval: Duration,
    /// Budget for punching a path and confirming it with the server.
    pub dial_timeout: Duration,
    pub dial_interval: Duration,
    pub connect_attempts: usize,
    pub attempt_timeout: Duration,
    pub attempt_backoff: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            info_timeout: INFO_TIMEOUT,
            retransmit_interval: RETRANSMIT_INTERVAL,
            dial_timeout: DIAL_TIMEOUT,
            dial_interval: udp::DIAL_INTERVAL,
            connect_attempts: tcp::CONNECT_ATTEMPTS,
            attempt_timeout: tcp::ATTEMPT_TIMEOUT,
            attempt_backoff: tcp::ATTEMPT_BACKOFF,
        }
    }
}

/// How the peers reach each other once paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    Udp,
    Tcp,
}

impl FromStr for DialMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(DialMode::Udp),
            "tcp" => Ok(DialMode::Tcp),
            other => Err(Error::InvalidArgument(format!("unknown dial mode {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The TCP or TLS control stream; falls back to datagrams for UDP clients.
    Control,
    /// The client's UDP socket, so the server records its UDP mapping.
    Datagram,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Resend the same message at this interval until answered.
    pub retransmit: Option<Duration>,
    pub channel: Channel,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: REQUEST_TIMEOUT,
            retransmit: None,
            channel: Channel::Control,
        }
    }
}

/// A direct path to the peer.
#[derive(Debug)]
pub enum Connection {
    Udp { socket: UdpSocket, peer: SocketAddr },
    Tcp(TcpStream),
}

pub(crate) trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ControlStream for T {}

#[derive(Default)]
struct Inflight {
    waiters: HashMap<u32, oneshot::Sender<Message>>,
    closed: bool,
}

type Waiters = Arc<Mutex<Inflight>>;

fn deliver(inflight: &Mutex<Inflight>, msg: Message) {
    match inflight.lock().waiters.remove(&msg.nonce) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => log::debug!("dropping {} with unknown nonce {}", msg.kind, msg.nonce),
    }
}

struct Control {
    writer: WriteHalf<Box<dyn ControlStream>>,
    _reader: AbortOnDrop,
}

pub(crate) struct Datagram {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) reader: AbortOnDrop,
    /// Sources of DIAL messages, for the traversal to match against the peer.
    pub(crate) dials: UnboundedReceiver<SocketAddr>,
}

pub struct Client {
    pub(crate) server_addr: SocketAddr,
    pub(crate) protocol: Protocol,
    control: Option<Control>,
    pub(crate) datagram: Option<Datagram>,
    inflight: Waiters,
    nonce: u32,
    sid: Option<SessionId>,
    peer_sid: Option<SessionId>,
    mode: Option<DialMode>,
    pub(crate) info: Option<InfoResponse>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) port_delta: Option<PortDelta>,
    pub(crate) config: DialConfig,
}

/// Resolve `host:port` to its first IPv4 address.
pub(crate) async fn resolve(server_addr: &str) -> Result<SocketAddr> {
    lookup_host(server_addr)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::InvalidArgument(format!("cannot resolve {} to ipv4", server_addr)))
}

pub(crate) fn port_from_body(body: &[u8]) -> Result<u16> {
    match *body {
        [hi, lo] => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(Error::MalformedMessage(format!(
            "port body of {} bytes",
            body.len()
        ))),
    }
}

impl Client {
    fn unconnected(server_addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            server_addr,
            protocol,
            control: None,
            datagram: None,
            inflight: Default::default(),
            nonce: 0,
            sid: None,
            peer_sid: None,
            mode: None,
            info: None,
            local_addr: (Ipv4Addr::UNSPECIFIED, 0).into(),
            port_delta: None,
            config: DialConfig::default(),
        }
    }

    /// UDP client on an already bound socket, such as one returned by
    /// [`Client::into_datagram_socket`].
    pub async fn with_datagram_socket(server_addr: &str, socket: UdpSocket) -> Result<Self> {
        Self::on_socket(resolve(server_addr).await?, socket)
    }

    pub(crate) fn on_socket(server_addr: SocketAddr, socket: UdpSocket) -> Result<Self> {
        let mut client = Self::unconnected(server_addr, Protocol::Udp);
        client.local_addr = client.attach_datagram(socket)?.local_addr()?;
        Ok(client)
    }

    /// Open a control channel to the server at `server_addr` (`host:port`).
    pub async fn new(server_addr: &str, protocol: Protocol) -> Result<Self> {
        let resolved = resolve(server_addr).await?;
        let mut client = Self::unconnected(resolved, protocol);

        client.local_addr = match protocol {
            Protocol::Udp => client.datagram_socket()?.local_addr()?,
            _ => {
                let (stream, local_addr) = client.connect_stream().await?;
                let (r, w) = split(stream);
                let reader = task::spawn(Self::read_control(r, client.inflight.clone()));
                client.control = Some(Control {
                    writer: w,
                    _reader: AbortOnDrop(reader),
                });
                local_addr
            }
        };

        log::debug!(
            "connected to {}://{} from {}",
            protocol,
            resolved,
            client.local_addr
        );
        Ok(client)
    }

    pub fn id(&self) -> Option<SessionId> {
        self.sid
    }

    pub fn peer_id(&self) -> Option<SessionId> {
        self.peer_sid
    }

    /// Pairing result, once [`Client::request_info`] succeeded.
    pub fn info(&self) -> Option<InfoResponse> {
        self.info
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port_delta(&self) -> Option<PortDelta> {
        self.port_delta
    }

    /// Use a known delta instead of measuring it.
    pub fn set_port_delta(&mut self, delta: PortDelta) {
        self.port_delta = Some(delta);
    }

    pub fn config(&self) -> DialConfig {
        self.config
    }

    pub fn set_config(&mut self, config: DialConfig) {
        self.config = config;
    }

    pub async fn request_id(&mut self) -> Result<SessionId> {
        let reply = self
            .request(
                MessageType::IdRequest,
                Vec::new(),
                self.options(self.config.request_timeout),
            )
            .await?;
        let sid = SessionId::from_bytes(&reply.body)?;

        log::debug!("session id {}", sid);
        self.sid = Some(sid);
        Ok(sid)
    }

    /// External port of the control channel, as observed by the server.
    pub async fn request_port(&mut self) -> Result<u16> {
        let reply = self
            .request(
                MessageType::PortRequest,
                Vec::new(),
                self.options(self.config.request_timeout),
            )
            .await?;
        port_from_body(&reply.body)
    }

    /// Ask the server to pair this session with `peer`.
    ///
    /// Resolves once the peer asked for us as well.
    pub async fn request_info(&mut self, peer: SessionId, mode: DialMode) -> Result<InfoResponse> {
        let sid = self
            .sid
            .ok_or_else(|| Error::InvalidArgument("no session id yet".into()))?;

        let (channel, port_delta) = match mode {
            DialMode::Udp => (Channel::Datagram, None),
            DialMode::Tcp => {
                if self.protocol == Protocol::Udp {
                    return Err(Error::InvalidArgument(
                        "tcp dial needs a stream control channel".into(),
                    ));
                }
                let delta = match self.port_delta {
                    Some(d) => d,
                    None => self.measure_port_delta().await?,
                };
                (Channel::Control, Some(delta))
            }
        };

        let body = InfoRequest {
            sid,
            target: peer,
            port_delta,
        }
        .encode();
        let opts = RequestOptions {
            timeout: self.config.info_timeout,
            retransmit: (channel == Channel::Datagram).then_some(self.config.retransmit_interval),
            channel,
        };
        let reply = self.request(MessageType::InfoRequest, body, opts).await?;
        let info = InfoResponse::decode(&reply.body)?;

        log::debug!(
            "paired with {} at {} (initiator: {}, peer delta: {:?})",
            peer,
            info.peer,
            info.initiator,
            info.peer_port_delta
        );
        self.peer_sid = Some(peer);
        self.mode = Some(mode);
        self.info = Some(info);
        Ok(info)
    }

    /// Open the direct path chosen in [`Client::request_info`].
    pub async fn dial(&mut self) -> Result<Connection> {
        match self.mode {
            Some(DialMode::Udp) => {
                let (socket, peer) = self.dial_udp().await?;
                Ok(Connection::Udp { socket, peer })
            }
            Some(DialMode::Tcp) => Ok(Connection::Tcp(self.dial_tcp().await?)),
            None => Err(Error::InvalidArgument("not paired".into())),
        }
    }

    /// Send a request and wait for the reply carrying the same nonce.
    ///
    /// An `ERROR` reply becomes the matching [`Error`]. Any other unexpected
    /// reply type closes the control channel.
    pub async fn request(
        &mut self,
        kind: MessageType,
        body: Vec<u8>,
        opts: RequestOptions,
    ) -> Result<Message> {
        let expected = kind
            .response()
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not a request", kind)))?;

        let msg = Message::new(kind, self.next_nonce(), body);
        let rx = self.register(msg.nonce)?;
        let res = self.exchange(&msg, rx, opts).await;
        self.inflight.lock().waiters.remove(&msg.nonce);

        let reply = res?;
        match reply.kind {
            k if k == expected => Ok(reply),
            MessageType::Error => {
                let reason = String::from_utf8_lossy(&reply.body);
                log::debug!("{} rejected: {}", kind, reason);
                Err(Error::from_reason(&reason))
            }
            other => {
                self.close_control().await;
                Err(Error::ProtocolViolation(format!(
                    "expected {} but got {}",
                    expected, other
                )))
            }
        }
    }

    /// Stop background tasks and close the control channel.
    pub async fn close(mut self) {
        self.close_control().await;
        if let Some(d) = self.datagram.take() {
            d.reader.cancel().await;
        }
    }

    fn options(&self, timeout: Duration) -> RequestOptions {
        RequestOptions {
            timeout,
            retransmit: (self.protocol == Protocol::Udp).then_some(self.config.retransmit_interval),
            channel: Channel::Control,
        }
    }

    fn next_nonce(&mut self) -> u32 {
        self.nonce = self.nonce.wrapping_add(1);
        self.nonce
    }

    fn register(&self, nonce: u32) -> Result<oneshot::Receiver<Message>> {
        let mut inflight = self.inflight.lock();
        if inflight.closed {
            return Err(Error::Closed);
        }

        let (tx, rx) = oneshot::channel();
        inflight.waiters.insert(nonce, tx);
        Ok(rx)
    }

    async fn exchange(
        &mut self,
        msg: &Message,
        rx: oneshot::Receiver<Message>,
        opts: RequestOptions,
    ) -> Result<Message> {
        let channel = match self.protocol {
            Protocol::Udp => Channel::Datagram,
            _ => opts.channel,
        };

        log::trace!("-> {} nonce={} via {:?}", msg.kind, msg.nonce, channel);
        let retransmit = match channel {
            Channel::Control => {
                let control = self.control.as_mut().ok_or(Error::Closed)?;
                write_message(&mut control.writer, msg).await?;
                None
            }
            Channel::Datagram => {
                let socket = self.datagram_socket()?;
                let buf = msg.encode()?;
                socket.send_to(&buf, self.server_addr).await?;
                opts.retransmit.map(|every| {
                    AbortOnDrop(task::spawn(Self::retransmit(
                        socket,
                        buf,
                        self.server_addr,
                        every,
                    )))
                })
            }
        };

        let res = timeout(opts.timeout, rx).await;
        if let Some(task) = retransmit {
            task.cancel().await;
        }

        match res {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    async fn retransmit(socket: Arc<UdpSocket>, buf: Vec<u8>, to: SocketAddr, every: Duration) {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            ticker.tick().await;
            log::trace!("retransmit {} bytes to {}", buf.len(), to);
            if let Err(e) = socket.send_to(&buf, to).await {
                log::debug!("retransmit to {} failed: {}", to, e);
            }
        }
    }

    /// Confirm the direct path to the server and wait for the peer to do the same.
    pub(crate) async fn confirm_dialed(&mut self) -> Result<()> {
        match self
            .request(
                MessageType::DialedRequest,
                Vec::new(),
                self.options(self.config.dial_timeout),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::RequestTimeout) => Err(Error::DialTimeout),
            Err(e) => Err(e),
        }
    }

    /// Fresh TCP (or TLS) connection to the server from an ephemeral, reusable port.
    pub(crate) async fn connect_stream(&self) -> Result<(Box<dyn ControlStream>, SocketAddr)> {
        let socket = tcp::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
        let stream = timeout(self.config.request_timeout, socket.connect(self.server_addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        let local_addr = stream.local_addr()?;

        let stream: Box<dyn ControlStream> = match self.protocol {
            #[cfg(feature = "tls")]
            Protocol::Tls => Box::new(
                tls::connector()?
                    .connect(tls::server_name(self.server_addr.ip()), stream)
                    .await?,
            ),
            Protocol::Udp => {
                return Err(Error::InvalidArgument(
                    "udp clients have no control stream".into(),
                ))
            }
            _ => Box::new(stream),
        };

        Ok((stream, local_addr))
    }

    /// The UDP socket, bound on first use.
    pub(crate) fn datagram_socket(&mut self) -> Result<Arc<UdpSocket>> {
        if let Some(d) = &self.datagram {
            return Ok(d.socket.clone());
        }

        let socket = udp::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
        self.attach_datagram(socket)
    }

    /// Start reading `socket` for server replies and peer DIALs.
    pub(crate) fn attach_datagram(&mut self, socket: UdpSocket) -> Result<Arc<UdpSocket>> {
        let socket = Arc::new(socket);
        let (tx, rx) = unbounded_channel();
        let reader = task::spawn(Self::read_datagrams(
            socket.clone(),
            self.server_addr,
            self.inflight.clone(),
            tx,
        ));
        log::debug!("datagram socket bound to {}", socket.local_addr()?);

        self.datagram = Some(Datagram {
            socket: socket.clone(),
            reader: AbortOnDrop(reader),
            dials: rx,
        });
        Ok(socket)
    }

    async fn close_control(&mut self) {
        if let Some(mut control) = self.control.take() {
            let _ = control.writer.shutdown().await;
        }

        let mut inflight = self.inflight.lock();
        inflight.closed = true;
        inflight.waiters.clear();
    }

    async fn read_control(r: ReadHalf<Box<dyn ControlStream>>, inflight: Waiters) {
        let mut reader = FramedReader::new(r);
        loop {
            match reader.next().await {
                Ok(Some(msg)) => deliver(&inflight, msg),
                Ok(None) => {
                    log::debug!("control channel closed by server");
                    break;
                }
                Err(e) => {
                    log::warn!("control channel failed: {}", e);
                    break;
                }
            }
        }

        // wakes every waiting request with Closed
        let mut inflight = inflight.lock();
        inflight.closed = true;
        inflight.waiters.clear();
    }

    async fn read_datagrams(
        socket: Arc<UdpSocket>,
        server_addr: SocketAddr,
        inflight: Waiters,
        dials: UnboundedSender<SocketAddr>,
    ) {
        let mut buf = [0; BUFFER_LENGTH];
        loop {
            let (size, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("datagram recv failed: {}", e);
                    continue;
                }
            };

            let msg = match Message::decode(&buf[..size]) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("dropping datagram from {}: {}", src, e);
                    continue;
                }
            };

            if msg.kind == MessageType::Dial {
                log::trace!("dial from {}", src);
                let _ = dials.send(src);
            } else if src == server_addr {
                deliver(&inflight, msg);
            } else {
                log::debug!("unsolicited {} from {}", msg.kind, src);
            }
        }
    }
}
