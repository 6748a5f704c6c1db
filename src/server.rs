//! Rendezvous server.

use crate::error::{Error, Result};
use crate::framing::{write_message, FramedReader};
use crate::proto::{Message, Protocol, BUFFER_LENGTH, DEFAULT_PORT};
use crate::session::{
    Effects, InitiatorPolicy, Outbound, Registry, Route, SessionKey, SESSION_LIFETIME,
};
#[cfg(feature = "tls")]
use crate::tls::{self, TlsIdentity};
use crate::AbortOnDrop;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::{pending, Future};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, UdpSocket},
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task,
    time::interval,
};
#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

const GC_INTERVAL: Duration = Duration::from_secs(10);
#[cfg(feature = "tls")]
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Accept TCP (or TLS) control connections.
    pub stream: bool,
    /// Serve UDP on the same port.
    pub datagram: bool,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsIdentity>,
    pub session_lifetime: Duration,
    pub initiator: InitiatorPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            stream: true,
            datagram: true,
            #[cfg(feature = "tls")]
            tls: None,
            session_lifetime: SESSION_LIFETIME,
            initiator: InitiatorPolicy::default(),
        }
    }
}

struct State {
    registry: Registry,
    streams: HashMap<SessionKey, UnboundedSender<Message>>,
    socket: Option<Arc<UdpSocket>>,
}

type Shared = Arc<Mutex<State>>;

impl State {
    // A reconnect from the same address replaces the old session and its stream.
    fn open_stream(
        &mut self,
        addr: SocketAddr,
        protocol: Protocol,
        tx: UnboundedSender<Message>,
    ) -> SessionKey {
        let (key, evicted) = self.registry.open_evicting(addr, protocol);
        if let Some(stale) = evicted {
            self.streams.remove(&stale);
        }
        self.streams.insert(key, tx);
        key
    }

    fn dispatch(&mut self, key: SessionKey, msg: Message, route: Route) {
        log::trace!("session {} <- {} nonce={}", key, msg.kind, msg.nonce);
        let effects = self.registry.handle(key, msg, route);
        self.apply(effects);
    }

    fn dispatch_datagram(&mut self, msg: Message, src: SocketAddr) {
        match self.registry.resolve_datagram(&msg, src) {
            Ok(key) => self.dispatch(key, msg, Route::Datagram(src)),
            Err(e) if msg.kind.response().is_some() => {
                log::debug!("{} from {}: {}", msg.kind, src, e);
                self.send_datagram(src, &Message::error(msg.nonce, &e.to_string()));
            }
            Err(_) => log::debug!("dropping unsolicited {} from {}", msg.kind, src),
        }
    }

    fn apply(&mut self, effects: Effects) {
        for Outbound { route, message } in effects.outbound {
            match route {
                Route::Stream(key) => match self.streams.get(&key) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => log::debug!("session {} gone, dropping {}", key, message.kind),
                },
                Route::Datagram(addr) => self.send_datagram(addr, &message),
            }
        }

        // dropping the sender lets the writer flush what is queued, then close
        for key in effects.closed {
            self.streams.remove(&key);
        }
    }

    fn send_datagram(&self, addr: SocketAddr, msg: &Message) {
        let socket = match &self.socket {
            Some(s) => s,
            None => {
                log::warn!("no datagram socket to reach {}", addr);
                return;
            }
        };

        match msg.encode() {
            Ok(buf) => {
                if let Err(e) = socket.try_send_to(&buf, addr) {
                    log::debug!("send {} to {} failed: {}", msg.kind, addr, e);
                }
            }
            Err(e) => log::warn!("encode {} failed: {}", msg.kind, e),
        }
    }

    fn expire(&mut self) {
        for key in self.registry.expire(Instant::now()) {
            self.streams.remove(&key);
        }
    }
}

/// Rendezvous server
///
/// observe client contacts over TCP (or TLS) and UDP on one port, pair sessions and confirm dials.
pub struct Server {
    listener: Option<TcpListener>,
    socket: Option<Arc<UdpSocket>>,
    state: Shared,
    #[cfg(feature = "tls")]
    acceptor: Option<TlsAcceptor>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let listener = match config.stream {
            true => Some(TcpListener::bind(config.listen_addr).await?),
            false => None,
        };

        // the UDP socket shares the port picked for the listener
        let udp_addr = match &listener {
            Some(l) => l.local_addr()?,
            None => config.listen_addr,
        };
        let socket = match config.datagram {
            true => Some(Arc::new(UdpSocket::bind(udp_addr).await?)),
            false => None,
        };

        #[cfg(feature = "tls")]
        let acceptor = config.tls.as_ref().map(tls::acceptor).transpose()?;

        let registry = Registry::new(config.initiator, config.session_lifetime);

        Ok(Self {
            listener,
            socket: socket.clone(),
            state: Arc::new(Mutex::new(State {
                registry,
                streams: Default::default(),
                socket,
            })),
            #[cfg(feature = "tls")]
            acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match (&self.listener, &self.socket) {
            (Some(l), _) => Ok(l.local_addr()?),
            (None, Some(s)) => Ok(s.local_addr()?),
            (None, None) => Err(Error::InvalidArgument("server has no listener".into())),
        }
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(pending()).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<()> {
        log::info!(
            "listening on {} (stream: {}, datagram: {})",
            self.local_addr()?,
            self.listener.is_some(),
            self.socket.is_some()
        );

        let gc = AbortOnDrop(task::spawn(Self::gc_loop(self.state.clone())));
        let datagram = self
            .socket
            .clone()
            .map(|s| AbortOnDrop(task::spawn(Self::datagram_loop(s, self.state.clone()))));

        let res = select! {
            r = self.accept_loop() => r,
            _ = shutdown => {
                log::info!("shutting down");
                Ok(())
            }
        };

        drop(gc);
        drop(datagram);
        self.state.lock().streams.clear();

        res
    }

    async fn accept_loop(&self) -> Result<()> {
        let listener = match &self.listener {
            Some(l) => l,
            None => return pending().await,
        };

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
            };
            let state = self.state.clone();

            #[cfg(feature = "tls")]
            if let Some(acceptor) = self.acceptor.clone() {
                task::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => {
                            Self::handle_stream(state, stream, addr, Protocol::Tls).await
                        }
                        Ok(Err(e)) => log::debug!("tls handshake with {} failed: {}", addr, e),
                        Err(_) => log::debug!("tls handshake with {} timed out", addr),
                    }
                });
                continue;
            }

            task::spawn(Self::handle_stream(state, stream, addr, Protocol::Tcp));
        }
    }

    async fn handle_stream<S>(state: Shared, stream: S, addr: SocketAddr, protocol: Protocol)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = unbounded_channel();
        let key = state.lock().open_stream(addr, protocol, tx);
        log::debug!("{}://{} connected as session {}", protocol, addr, key);

        let (r, w) = tokio::io::split(stream);
        let res = select! {
            r = Self::read_loop(&state, key, r) => r,
            r = Self::write_loop(w, rx) => r,
        };

        match res {
            Ok(()) => log::debug!("session {} disconnected", key),
            Err(e) if e.is_fatal() => log::warn!("closing {}: {}", addr, e),
            Err(e) => log::debug!("session {} ended: {}", key, e),
        }

        let mut st = state.lock();
        st.registry.remove(key);
        st.streams.remove(&key);
    }

    async fn read_loop<R: AsyncRead + Unpin>(state: &Shared, key: SessionKey, r: R) -> Result<()> {
        let mut reader = FramedReader::new(r);
        while let Some(msg) = reader.next().await? {
            state.lock().dispatch(key, msg, Route::Stream(key));
        }
        Ok(())
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        mut w: W,
        mut rx: UnboundedReceiver<Message>,
    ) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            write_message(&mut w, &msg).await?;
        }
        Ok(())
    }

    async fn datagram_loop(socket: Arc<UdpSocket>, state: Shared) {
        let mut buf = [0; BUFFER_LENGTH];

        loop {
            let (size, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("datagram recv failed: {}", e);
                    continue;
                }
            };

            match Message::decode(&buf[..size]) {
                Ok(msg) => state.lock().dispatch_datagram(msg, src),
                Err(e) => log::warn!("dropping datagram from {}: {}", src, e),
            }
        }
    }

    async fn gc_loop(state: Shared) {
        let mut ticker = interval(GC_INTERVAL);
        loop {
            ticker.tick().await;
            state.lock().expire();
        }
    }
}
