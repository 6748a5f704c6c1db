//! Wire format shared by the server, the clients and peers.
//!
//! Every message is framed the same way on every transport:
//!
//! ```text
//! +----------------+-----------+-----------------+-----------+
//! | length (2B BE) | type (1B) | nonce (4B BE)   | body      |
//! +----------------+-----------+-----------------+-----------+
//!                  |<-------------- length --------------->|
//! ```
//!
//! Streams carry a sequence of such frames (see [`crate::framing`]); each UDP
//! packet carries exactly one.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 12435;
/// Capacity of a stream reassembly buffer, and so the largest frame.
pub const BUFFER_LENGTH: usize = 4096;
pub const LENGTH_PREFIX: usize = 2;
/// type code + nonce
pub const META_LENGTH: usize = 5;
pub const MAX_BODY_LENGTH: usize = BUFFER_LENGTH - LENGTH_PREFIX - META_LENGTH;
pub const ID_LENGTH: usize = 6;
pub const CONTACT_LENGTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Dial = 0,
    DialedRequest = 1,
    DialedResponse = 2,
    Error = 3,
    IdRequest = 4,
    IdResponse = 5,
    InfoRequest = 6,
    InfoResponse = 7,
    PortRequest = 8,
    PortResponse = 9,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The reply type a request expects, `None` for anything that isn't a request.
    pub fn response(self) -> Option<MessageType> {
        match self {
            MessageType::DialedRequest => Some(MessageType::DialedResponse),
            MessageType::IdRequest => Some(MessageType::IdResponse),
            MessageType::InfoRequest => Some(MessageType::InfoResponse),
            MessageType::PortRequest => Some(MessageType::PortResponse),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => MessageType::Dial,
            1 => MessageType::DialedRequest,
            2 => MessageType::DialedResponse,
            3 => MessageType::Error,
            4 => MessageType::IdRequest,
            5 => MessageType::IdResponse,
            6 => MessageType::InfoRequest,
            7 => MessageType::InfoResponse,
            8 => MessageType::PortRequest,
            9 => MessageType::PortResponse,
            _ => {
                return Err(Error::MalformedMessage(format!(
                    "unknown message code {}",
                    code
                )))
            }
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Dial => "DIAL",
            MessageType::DialedRequest => "DIALED_REQUEST",
            MessageType::DialedResponse => "DIALED_RESPONSE",
            MessageType::Error => "ERROR",
            MessageType::IdRequest => "ID_REQUEST",
            MessageType::IdResponse => "ID_RESPONSE",
            MessageType::InfoRequest => "INFO_REQUEST",
            MessageType::InfoResponse => "INFO_RESPONSE",
            MessageType::PortRequest => "PORT_REQUEST",
            MessageType::PortResponse => "PORT_RESPONSE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub nonce: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new<B: Into<Vec<u8>>>(kind: MessageType, nonce: u32, body: B) -> Self {
        Self {
            kind,
            nonce,
            body: body.into(),
        }
    }

    pub fn empty(kind: MessageType, nonce: u32) -> Self {
        Self::new(kind, nonce, Vec::new())
    }

    pub fn error(nonce: u32, reason: &str) -> Self {
        Self::new(MessageType::Error, nonce, reason.as_bytes())
    }

    /// Peer-to-peer probe, never correlated with a reply.
    pub fn dial() -> Self {
        Self::empty(MessageType::Dial, 0)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_LENGTH {
            return Err(Error::MessageTooLong {
                len: self.body.len(),
                max: MAX_BODY_LENGTH,
            });
        }

        let len = (META_LENGTH + self.body.len()) as u16;
        let mut buf = Vec::with_capacity(LENGTH_PREFIX + len as usize);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(self.kind.code());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decode one complete frame, length prefix included.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LENGTH_PREFIX {
            return Err(Error::MalformedMessage("missing length prefix".into()));
        }

        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() != LENGTH_PREFIX + len {
            return Err(Error::MalformedMessage(format!(
                "declared length {} but got {} bytes",
                len,
                buf.len() - LENGTH_PREFIX
            )));
        }

        Self::decode_payload(&buf[LENGTH_PREFIX..])
    }

    /// Decode the part of a frame after the length prefix.
    pub(crate) fn decode_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < META_LENGTH {
            return Err(Error::MalformedMessage(format!(
                "length {} shorter than type and nonce",
                payload.len()
            )));
        }

        let kind = MessageType::try_from(payload[0])?;
        let nonce = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);

        Ok(Self::new(kind, nonce, &payload[META_LENGTH..]))
    }
}

/// Control channel flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    #[cfg(feature = "tls")]
    Tls,
    Udp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            #[cfg(feature = "tls")]
            "tls" => Ok(Protocol::Tls),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::InvalidArgument(format!("unknown protocol {}", other))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            #[cfg(feature = "tls")]
            Protocol::Tls => "tls",
            Protocol::Udp => "udp",
        })
    }
}

/// Externally observed IPv4 address and port of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contact {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Contact {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn to_bytes(&self) -> [u8; CONTACT_LENGTH] {
        let mut buf = [0; CONTACT_LENGTH];
        buf[..4].copy_from_slice(&self.addr.octets());
        buf[4..].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTACT_LENGTH {
            return Err(Error::MalformedMessage("contact too short".into()));
        }

        Ok(Self {
            addr: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            port: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }

    /// The contact shifted by a predicted port delta.
    pub fn offset(&self, delta: i16) -> Contact {
        Contact::new(self.addr, self.port.wrapping_add_signed(delta))
    }
}

impl TryFrom<SocketAddr> for Contact {
    type Error = Error;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or_else(|| {
                Error::InvalidArgument(format!("ipv6 contact {} not supported", addr))
            })?,
        };

        Ok(Contact::new(ip, addr.port()))
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Six random bytes naming a server session; base64 in text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; ID_LENGTH]);

impl SessionId {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let bytes: [u8; ID_LENGTH] = buf
            .get(..ID_LENGTH)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::MalformedMessage("session id too short".into()))?;
        Ok(SessionId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }
}

impl From<[u8; ID_LENGTH]> for SessionId {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        SessionId(bytes)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::InvalidArgument(format!("invalid session id: {}", e)))?;
        if bytes.len() != ID_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "session id must be {} bytes",
                ID_LENGTH
            )));
        }
        Self::from_bytes(&bytes)
    }
}

/// Increment a NAT applies between consecutive external port allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDelta {
    Fixed(i16),
    Unpredictable,
}

impl PortDelta {
    const UNPREDICTABLE: i16 = i16::MIN;

    pub fn to_wire(self) -> i16 {
        match self {
            PortDelta::Fixed(d) => d,
            PortDelta::Unpredictable => Self::UNPREDICTABLE,
        }
    }

    pub fn from_wire(v: i16) -> Self {
        if v == Self::UNPREDICTABLE {
            PortDelta::Unpredictable
        } else {
            PortDelta::Fixed(v)
        }
    }

    /// Derive the delta from externally observed ports of consecutive connections.
    pub fn from_samples(ports: &[u16]) -> Self {
        let mut deltas = ports
            .windows(2)
            .map(|w| i32::from(w[1]) - i32::from(w[0]));

        let first = match deltas.next() {
            Some(d) => d,
            None => return PortDelta::Fixed(0),
        };

        if deltas.any(|d| d != first) {
            return PortDelta::Unpredictable;
        }

        match i16::try_from(first) {
            Ok(d) if d != Self::UNPREDICTABLE => PortDelta::Fixed(d),
            _ => PortDelta::Unpredictable,
        }
    }
}

/// Body of `INFO_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRequest {
    pub sid: SessionId,
    pub target: SessionId,
    pub port_delta: Option<PortDelta>,
}

impl InfoRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * ID_LENGTH + 2);
        buf.extend_from_slice(self.sid.as_bytes());
        buf.extend_from_slice(self.target.as_bytes());
        if let Some(delta) = self.port_delta {
            buf.extend_from_slice(&delta.to_wire().to_be_bytes());
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 2 * ID_LENGTH {
            return Err(Error::MalformedMessage("info request too short".into()));
        }

        let port_delta = match body.get(2 * ID_LENGTH..2 * ID_LENGTH + 2) {
            Some(b) => Some(PortDelta::from_wire(i16::from_be_bytes([b[0], b[1]]))),
            None => None,
        };

        Ok(Self {
            sid: SessionId::from_bytes(&body[..ID_LENGTH])?,
            target: SessionId::from_bytes(&body[ID_LENGTH..])?,
            port_delta,
        })
    }
}

/// Body of `INFO_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoResponse {
    pub peer: Contact,
    pub own: Option<Contact>,
    pub initiator: bool,
    pub peer_port_delta: PortDelta,
}

impl InfoResponse {
    const INITIATOR: u8 = 0x01;
    const FULL_LENGTH: usize = 2 * CONTACT_LENGTH + 1 + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FULL_LENGTH);
        buf.extend_from_slice(&self.peer.to_bytes());
        match self.own {
            Some(own) => buf.extend_from_slice(&own.to_bytes()),
            None => buf.extend_from_slice(&[0; CONTACT_LENGTH]),
        }
        buf.push(if self.initiator { Self::INITIATOR } else { 0 });
        buf.extend_from_slice(&self.peer_port_delta.to_wire().to_be_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        match body.len() {
            CONTACT_LENGTH => Ok(Self {
                peer: Contact::from_bytes(body)?,
                own: None,
                initiator: false,
                peer_port_delta: PortDelta::Fixed(0),
            }),
            Self::FULL_LENGTH => {
                let own = Contact::from_bytes(&body[CONTACT_LENGTH..])?;
                Ok(Self {
                    peer: Contact::from_bytes(body)?,
                    own: (own.port != 0).then_some(own),
                    initiator: body[2 * CONTACT_LENGTH] & Self::INITIATOR != 0,
                    peer_port_delta: PortDelta::from_wire(i16::from_be_bytes([
                        body[2 * CONTACT_LENGTH + 1],
                        body[2 * CONTACT_LENGTH + 2],
                    ])),
                })
            }
            n => Err(Error::MalformedMessage(format!(
                "info response of {} bytes",
                n
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = Message::new(MessageType::InfoResponse, 0x01020304, &b"foobar"[..]);
        let buf = msg.encode().unwrap();

        assert_eq!(&buf[..2], &11u16.to_be_bytes());
        assert_eq!(buf[2], 7);
        assert_eq!(&buf[3..7], &[1, 2, 3, 4]);
        assert_eq!(&buf[7..], b"foobar");
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(
            Message::decode(&[]),
            Err(Error::MalformedMessage(_))
        ));
        // length says 5, only 4 bytes follow
        assert!(matches!(
            Message::decode(&[0, 5, 4, 0, 0, 0]),
            Err(Error::MalformedMessage(_))
        ));
        // too short for type and nonce
        assert!(matches!(
            Message::decode(&[0, 2, 4, 0]),
            Err(Error::MalformedMessage(_))
        ));
        // unknown type code
        assert!(matches!(
            Message::decode(&[0, 5, 42, 0, 0, 0, 1]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_body_limit() {
        let msg = Message::new(MessageType::Error, 1, vec![0; MAX_BODY_LENGTH]);
        assert_eq!(msg.encode().unwrap().len(), BUFFER_LENGTH);

        let msg = Message::new(MessageType::Error, 1, vec![0; MAX_BODY_LENGTH + 1]);
        assert!(matches!(msg.encode(), Err(Error::MessageTooLong { .. })));
    }

    #[test]
    fn test_contact() {
        let addr: SocketAddr = "1.2.3.4:4660".parse().unwrap();
        let contact = Contact::try_from(addr).unwrap();

        assert_eq!(contact.to_bytes(), [1, 2, 3, 4, 0x12, 0x34]);
        assert_eq!(Contact::from_bytes(&contact.to_bytes()).unwrap(), contact);
        assert_eq!(contact.socket_addr(), addr);
        assert_eq!(contact.offset(-2).port, 4658);

        let mapped: SocketAddr = "[::ffff:1.2.3.4]:4660".parse().unwrap();
        assert_eq!(Contact::try_from(mapped).unwrap(), contact);

        let v6: SocketAddr = "[2001:db8::1]:4660".parse().unwrap();
        assert!(Contact::try_from(v6).is_err());
    }

    #[test]
    fn test_session_id_text() {
        let id = SessionId::from([0xfb, 0xff, 0x00, 0x01, 0x02, 0x03]);
        let text = id.to_string();

        assert_eq!(text.len(), 8);
        assert_eq!(text.parse::<SessionId>().unwrap(), id);
        assert!("AAAA".parse::<SessionId>().is_err());
        assert!("not base64!".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_port_delta_from_samples() {
        assert_eq!(
            PortDelta::from_samples(&[1000, 1002, 1004, 1006, 1008]),
            PortDelta::Fixed(2)
        );
        assert_eq!(
            PortDelta::from_samples(&[4000, 4000, 4000]),
            PortDelta::Fixed(0)
        );
        assert_eq!(
            PortDelta::from_samples(&[1000, 1001, 1005]),
            PortDelta::Unpredictable
        );
        assert_eq!(PortDelta::from_samples(&[1000]), PortDelta::Fixed(0));
        assert_eq!(
            PortDelta::from_samples(&[0, 40000]),
            PortDelta::Unpredictable
        );
        assert_eq!(
            PortDelta::from_wire(PortDelta::Unpredictable.to_wire()),
            PortDelta::Unpredictable
        );
    }

    #[test]
    fn test_info_bodies() {
        let req = InfoRequest {
            sid: SessionId::from([1; 6]),
            target: SessionId::from([2; 6]),
            port_delta: None,
        };
        assert_eq!(req.encode().len(), 12);
        assert_eq!(InfoRequest::decode(&req.encode()).unwrap(), req);

        let req = InfoRequest {
            port_delta: Some(PortDelta::Fixed(-1)),
            ..req
        };
        assert_eq!(InfoRequest::decode(&req.encode()).unwrap(), req);
        assert!(InfoRequest::decode(&[1; 11]).is_err());

        let resp = InfoResponse {
            peer: Contact::new(Ipv4Addr::new(10, 0, 0, 1), 5000),
            own: Some(Contact::new(Ipv4Addr::new(10, 0, 0, 2), 6000)),
            initiator: true,
            peer_port_delta: PortDelta::Unpredictable,
        };
        assert_eq!(InfoResponse::decode(&resp.encode()).unwrap(), resp);

        let legacy = InfoResponse::decode(&resp.peer.to_bytes()).unwrap();
        assert_eq!(legacy.peer, resp.peer);
        assert_eq!(legacy.own, None);
        assert!(!legacy.initiator);
    }
}
