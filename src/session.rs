//! Server-side sessions and the registry that owns them.
//!
//! The registry is a plain value: it maps an inbound request on a session to the
//! replies it causes ([`Effects`]) and never touches a socket itself. The server
//! serializes every call under one lock and delivers the effects.

use crate::error::{Error, Result};
use crate::proto::{
    Contact, InfoRequest, InfoResponse, Message, MessageType, PortDelta, Protocol, SessionId,
    ID_LENGTH,
};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const SESSION_LIFETIME: Duration = Duration::from_secs(5 * 60);
const ID_ATTEMPTS: usize = 5;

pub type SessionKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Initial,
    Identified,
    Pairing,
    Paired,
    Dialed,
    Done,
}

/// Where a reply goes: down a session's control stream or to a UDP source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Stream(SessionKey),
    Datagram(SocketAddr),
}

impl Route {
    pub fn is_datagram(&self) -> bool {
        matches!(self, Route::Datagram(_))
    }
}

/// Which of two paired sessions is told to open the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitiatorPolicy {
    /// The session whose pairing request completed the pair.
    #[default]
    LastArrival,
    FirstArrival,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub route: Route,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    /// Sessions removed by this step whose connections should be closed.
    pub closed: Vec<SessionKey>,
}

impl Effects {
    fn reply(&mut self, route: Route, message: Message) {
        self.outbound.push(Outbound { route, message });
    }
}

// Weak back-pointer: valid only while `key` still maps to a session named `id`.
#[derive(Debug, Clone, Copy)]
struct PeerRef {
    key: SessionKey,
    id: SessionId,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    nonce: u32,
    route: Route,
}

#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    url: String,
    addr: SocketAddr,
    id: Option<SessionId>,
    id_nonce: u32,
    contact: Option<Contact>,
    contact_via_datagram: bool,
    port_delta: PortDelta,
    peer: Option<PeerRef>,
    state: SessionState,
    pending: Option<Pending>,
    initiator: bool,
    created: Instant,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> Option<SessionId> {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn contact(&self) -> Option<Contact> {
        self.contact
    }

    pub fn peer_id(&self) -> Option<SessionId> {
        self.peer.map(|p| p.id)
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }
}

pub struct Registry {
    sessions: HashMap<SessionKey, Session>,
    by_id: HashMap<SessionId, SessionKey>,
    by_url: HashMap<String, SessionKey>,
    next_key: SessionKey,
    policy: InitiatorPolicy,
    lifetime: Duration,
    rng: Box<dyn RngCore + Send>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(InitiatorPolicy::default(), SESSION_LIFETIME)
    }
}

impl Registry {
    pub fn new(policy: InitiatorPolicy, lifetime: Duration) -> Self {
        Self {
            sessions: Default::default(),
            by_id: Default::default(),
            by_url: Default::default(),
            next_key: 0,
            policy,
            lifetime,
            rng: Box::new(OsRng),
        }
    }

    /// Replace the id source.
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session for a newly seen control connection or datagram source.
    pub fn open(&mut self, addr: SocketAddr, protocol: Protocol) -> SessionKey {
        self.open_evicting(addr, protocol).0
    }

    /// Like [`Registry::open`], also returning the session previously opened
    /// from the same address, which is dropped.
    pub fn open_evicting(
        &mut self,
        addr: SocketAddr,
        protocol: Protocol,
    ) -> (SessionKey, Option<SessionKey>) {
        self.next_key += 1;
        let key = self.next_key;
        let url = format!("{}://{}", protocol, addr);

        let evicted = self.by_url.insert(url.clone(), key);
        if let Some(stale) = evicted {
            log::debug!("{} reopened, dropping session {}", url, stale);
            self.remove(stale);
        }

        self.sessions.insert(
            key,
            Session {
                key,
                url,
                addr,
                id: None,
                id_nonce: 0,
                contact: None,
                contact_via_datagram: false,
                port_delta: PortDelta::Fixed(0),
                peer: None,
                state: SessionState::Initial,
                pending: None,
                initiator: false,
                created: Instant::now(),
            },
        );

        (key, evicted)
    }

    pub fn get(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.get(&key)
    }

    pub fn find(&self, id: &SessionId) -> Option<&Session> {
        self.by_id.get(id).and_then(|key| self.sessions.get(key))
    }

    pub fn find_by_url(&self, url: &str) -> Option<&Session> {
        self.by_url.get(url).and_then(|key| self.sessions.get(key))
    }

    pub fn remove(&mut self, key: SessionKey) -> Option<Session> {
        let session = self.sessions.remove(&key)?;

        if let Some(id) = session.id {
            if self.by_id.get(&id) == Some(&key) {
                self.by_id.remove(&id);
            }
        }
        if self.by_url.get(&session.url) == Some(&key) {
            self.by_url.remove(&session.url);
        }

        Some(session)
    }

    /// Drop every session that outlived the lifetime, returning their keys.
    pub fn expire(&mut self, now: Instant) -> Vec<SessionKey> {
        let expired: Vec<SessionKey> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.created) >= self.lifetime)
            .map(|s| s.key)
            .collect();

        for key in &expired {
            if let Some(s) = self.remove(*key) {
                log::debug!("session {} expired", s.url);
            }
        }

        expired
    }

    /// Find the session an inbound datagram belongs to.
    ///
    /// `INFO_REQUEST` carries the sender's id, so it can reach a session whose
    /// control channel is a stream. Anything else is keyed by source address;
    /// an unknown source may only open a session with `ID_REQUEST` or `PORT_REQUEST`.
    pub fn resolve_datagram(&mut self, msg: &Message, src: SocketAddr) -> Result<SessionKey> {
        if msg.kind == MessageType::InfoRequest {
            let sid = SessionId::from_bytes(&msg.body)?;
            return self.by_id.get(&sid).copied().ok_or(Error::SessionNotFound);
        }

        let url = format!("{}://{}", Protocol::Udp, src);
        if let Some(key) = self.by_url.get(&url) {
            return Ok(*key);
        }

        if matches!(msg.kind, MessageType::IdRequest | MessageType::PortRequest) {
            return Ok(self.open(src, Protocol::Udp));
        }

        Err(Error::SessionNotFound)
    }

    /// Run one inbound message through a session's state machine.
    ///
    /// Requests invalid for the current state are answered with `ERROR` and
    /// leave the state untouched.
    pub fn handle(&mut self, key: SessionKey, msg: Message, route: Route) -> Effects {
        let mut effects = Effects::default();
        let (kind, nonce) = (msg.kind, msg.nonce);

        let result = match kind {
            MessageType::IdRequest => self.handle_id_request(key, nonce, route, &mut effects),
            MessageType::InfoRequest => {
                self.handle_info_request(key, &msg, route, &mut effects)
            }
            MessageType::DialedRequest => {
                self.handle_dialed_request(key, nonce, route, &mut effects)
            }
            MessageType::PortRequest => {
                self.handle_port_request(key, nonce, route, &mut effects)
            }
            other => Err(Error::ProtocolViolation(format!(
                "Unexpected message: code={}, type={}",
                other.code(),
                other
            ))),
        };

        if let Err(e) = result {
            log::debug!(
                "session {} rejected {}: {}",
                self.sessions.get(&key).map(|s| s.url.as_str()).unwrap_or("?"),
                kind,
                e
            );
            effects.reply(route, Message::error(nonce, &e.to_string()));
        }

        effects
    }

    fn session(&self, key: SessionKey) -> Result<&Session> {
        self.sessions.get(&key).ok_or(Error::SessionNotFound)
    }

    fn session_mut(&mut self, key: SessionKey) -> Result<&mut Session> {
        self.sessions.get_mut(&key).ok_or(Error::SessionNotFound)
    }

    fn source(&self, key: SessionKey, route: Route) -> Result<SocketAddr> {
        match route {
            Route::Datagram(addr) => Ok(addr),
            Route::Stream(_) => Ok(self.session(key)?.addr),
        }
    }

    // Follow the peer back-pointer only if the slot still holds the same session.
    fn peer_key(&self, key: SessionKey) -> Option<SessionKey> {
        let p = self.sessions.get(&key)?.peer?;
        let peer = self.sessions.get(&p.key)?;
        (peer.id == Some(p.id)).then_some(p.key)
    }

    // A pairing session whose peer has since closed or been replaced.
    fn pairing_peer_gone(&self, key: SessionKey) -> bool {
        match self.sessions.get(&key) {
            Some(s) => {
                s.state == SessionState::Pairing && s.peer.is_some() && self.peer_key(key).is_none()
            }
            None => false,
        }
    }

    // Back to IDENTIFIED, returning the request that was waiting on the peer.
    fn unpair(&mut self, key: SessionKey) -> Result<Option<Pending>> {
        let session = self.session_mut(key)?;
        session.peer = None;
        session.contact = None;
        session.state = SessionState::Identified;
        log::debug!("session {} lost its peer", session.url);
        Ok(session.pending.take())
    }

    fn info_for(&self, key: SessionKey) -> Result<InfoResponse> {
        let session = self.session(key)?;
        let peer = self
            .peer_key(key)
            .and_then(|k| self.sessions.get(&k))
            .ok_or(Error::PeerClosed)?;
        let peer_contact = peer
            .contact
            .ok_or_else(|| Error::ProtocolViolation("Peer contact unknown".into()))?;

        Ok(InfoResponse {
            peer: peer_contact,
            own: session.contact,
            initiator: session.initiator,
            peer_port_delta: peer.port_delta,
        })
    }

    fn identify(&mut self, key: SessionKey) -> Result<SessionId> {
        for _ in 0..ID_ATTEMPTS {
            let mut buf = [0u8; ID_LENGTH];
            if let Err(e) = self.rng.try_fill_bytes(&mut buf) {
                log::warn!("random source failed: {}", e);
                continue;
            }

            let id = SessionId::from(buf);
            if self.by_id.contains_key(&id) {
                log::debug!("session id {} collided", id);
                continue;
            }

            self.session_mut(key)?.id = Some(id);
            self.by_id.insert(id, key);
            return Ok(id);
        }

        Err(Error::ServiceUnavailable)
    }

    fn handle_id_request(
        &mut self,
        key: SessionKey,
        nonce: u32,
        route: Route,
        effects: &mut Effects,
    ) -> Result<()> {
        let session = self.session(key)?;

        if session.state != SessionState::Initial {
            // a retransmission carries the nonce that identified the session
            return match session.id {
                Some(id) if session.id_nonce == nonce => {
                    effects.reply(
                        route,
                        Message::new(MessageType::IdResponse, nonce, id.as_bytes().to_vec()),
                    );
                    Ok(())
                }
                _ => Err(Error::ProtocolViolation("Unexpected id request".into())),
            };
        }

        let id = self.identify(key)?;
        let session = self.session_mut(key)?;
        session.state = SessionState::Identified;
        session.id_nonce = nonce;
        log::debug!("session {} identified as {}", session.url, id);

        effects.reply(
            route,
            Message::new(MessageType::IdResponse, nonce, id.as_bytes().to_vec()),
        );
        Ok(())
    }

    fn handle_info_request(
        &mut self,
        key: SessionKey,
        msg: &Message,
        route: Route,
        effects: &mut Effects,
    ) -> Result<()> {
        let req = InfoRequest::decode(&msg.body)?;
        let nonce = msg.nonce;
        let contact = Contact::try_from(self.source(key, route)?)?;
        let session = self.session(key)?;

        let own = match session.id {
            Some(id) => id,
            None => return Err(Error::ProtocolViolation("Unexpected info request".into())),
        };
        if req.sid != own {
            return Err(Error::ProtocolViolation("Session id mismatch".into()));
        }

        match session.state {
            SessionState::Identified => {}
            SessionState::Pairing if session.peer_id() == Some(req.target) => {
                if self.pairing_peer_gone(key) {
                    self.unpair(key)?;
                    return Err(Error::PeerClosed);
                }

                // retransmitted while waiting: answer on the latest nonce and route
                let session = self.session_mut(key)?;
                session.pending = Some(Pending { nonce, route });
                session.contact = Some(contact);
                return Ok(());
            }
            SessionState::Paired | SessionState::Dialed | SessionState::Done
                if session.peer_id() == Some(req.target) =>
            {
                let info = self.info_for(key)?;
                effects.reply(
                    route,
                    Message::new(MessageType::InfoResponse, nonce, info.encode()),
                );
                return Ok(());
            }
            _ => return Err(Error::ProtocolViolation("Already issued info request".into())),
        }

        if req.target == own {
            return Err(Error::SelfPairing);
        }

        let target_key = *self.by_id.get(&req.target).ok_or(Error::SessionNotFound)?;
        if self.pairing_peer_gone(target_key) {
            if let Some(p) = self.unpair(target_key)? {
                let reason = Error::PeerClosed.to_string();
                effects.reply(p.route, Message::error(p.nonce, &reason));
            }
        }
        let target = self.session(target_key)?;
        let port_delta = req.port_delta.unwrap_or(PortDelta::Fixed(0));
        let via_datagram = route.is_datagram();

        let target_pending = match target.peer {
            None => {
                let session = self.session_mut(key)?;
                session.peer = Some(PeerRef {
                    key: target_key,
                    id: req.target,
                });
                session.pending = Some(Pending { nonce, route });
                session.contact = Some(contact);
                session.contact_via_datagram = via_datagram;
                session.port_delta = port_delta;
                session.state = SessionState::Pairing;
                log::debug!("session {} waiting for {}", own, req.target);
                return Ok(());
            }
            Some(p) if p.key != key || p.id != own => return Err(Error::AlreadyPaired),
            Some(_) => match (target.state, target.pending) {
                (SessionState::Pairing, Some(pending)) => pending,
                _ => return Err(Error::AlreadyPaired),
            },
        };

        if target.contact_via_datagram != via_datagram {
            return Err(Error::ProtocolMismatch);
        }

        let last_is_initiator = self.policy == InitiatorPolicy::LastArrival;

        let session = self.session_mut(key)?;
        session.peer = Some(PeerRef {
            key: target_key,
            id: req.target,
        });
        session.contact = Some(contact);
        session.contact_via_datagram = via_datagram;
        session.port_delta = port_delta;
        session.initiator = last_is_initiator;
        session.state = SessionState::Paired;

        let target = self.session_mut(target_key)?;
        target.initiator = !last_is_initiator;
        target.pending = None;
        target.state = SessionState::Paired;

        log::debug!("sessions {} and {} paired", own, req.target);

        let info = self.info_for(key)?;
        effects.reply(
            route,
            Message::new(MessageType::InfoResponse, nonce, info.encode()),
        );
        let info = self.info_for(target_key)?;
        effects.reply(
            target_pending.route,
            Message::new(MessageType::InfoResponse, target_pending.nonce, info.encode()),
        );
        Ok(())
    }

    fn handle_dialed_request(
        &mut self,
        key: SessionKey,
        nonce: u32,
        route: Route,
        effects: &mut Effects,
    ) -> Result<()> {
        match self.session(key)?.state {
            SessionState::Paired => {}
            SessionState::Dialed => {
                self.session_mut(key)?.pending = Some(Pending { nonce, route });
                return Ok(());
            }
            _ => return Err(Error::ProtocolViolation("Unexpected dialed request".into())),
        }

        let peer_key = self.peer_key(key).ok_or(Error::PeerClosed)?;
        let peer = self.session(peer_key)?;

        let peer_pending = match (peer.state, peer.pending) {
            (SessionState::Dialed, Some(pending)) => pending,
            _ => {
                let session = self.session_mut(key)?;
                session.pending = Some(Pending { nonce, route });
                session.state = SessionState::Dialed;
                log::debug!("session {} dialed, waiting for peer", session.url);
                return Ok(());
            }
        };

        effects.reply(
            peer_pending.route,
            Message::empty(MessageType::DialedResponse, peer_pending.nonce),
        );
        effects.reply(route, Message::empty(MessageType::DialedResponse, nonce));

        for k in [key, peer_key] {
            let session = self.session_mut(k)?;
            session.state = SessionState::Done;
            log::debug!("session {} done", session.url);

            self.remove(k);
            effects.closed.push(k);
        }
        Ok(())
    }

    fn handle_port_request(
        &mut self,
        key: SessionKey,
        nonce: u32,
        route: Route,
        effects: &mut Effects,
    ) -> Result<()> {
        let port = self.source(key, route)?.port();
        effects.reply(
            route,
            Message::new(MessageType::PortResponse, nonce, port.to_be_bytes().to_vec()),
        );
        Ok(())
    }
}
