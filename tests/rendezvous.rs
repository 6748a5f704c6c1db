use holepunch::client::{Channel, Client, Connection, DialConfig, DialMode, RequestOptions};
use holepunch::proto::{Message, MessageType, PortDelta, Protocol, SessionId};
use holepunch::server::{Config, Server};
use holepunch::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

async fn start_server(config: Config) -> (String, oneshot::Sender<()>) {
    let server = Server::new(Config {
        listen_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        ..config
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    (addr.to_string(), tx)
}

async fn identified(addr: &str, protocol: Protocol) -> (Client, SessionId) {
    let mut client = Client::new(addr, protocol).await.unwrap();
    let id = client.request_id().await.unwrap();
    (client, id)
}

// the other side may still be sending DIALs
async fn recv_payload(socket: &UdpSocket, from: SocketAddr) -> Vec<u8> {
    let mut buf = [0; 1500];
    loop {
        let (n, src) = socket.recv_from(&mut buf).await.unwrap();
        if src != from {
            continue;
        }
        match Message::decode(&buf[..n]) {
            Ok(msg) if msg.kind == MessageType::Dial => continue,
            _ => return buf[..n].to_vec(),
        }
    }
}

async fn exchange_udp(a: Connection, b: Connection) {
    let (sa, pa, sb, pb) = match (a, b) {
        (
            Connection::Udp {
                socket: sa,
                peer: pa,
            },
            Connection::Udp {
                socket: sb,
                peer: pb,
            },
        ) => (sa, pa, sb, pb),
        other => panic!("unexpected connections {:?}", other),
    };

    sa.send_to(b"ping", pa).await.unwrap();
    let got = timeout(Duration::from_secs(5), recv_payload(&sb, pb))
        .await
        .unwrap();
    assert_eq!(got, b"ping");

    sb.send_to(b"pong", pb).await.unwrap();
    let got = timeout(Duration::from_secs(5), recv_payload(&sa, pa))
        .await
        .unwrap();
    assert_eq!(got, b"pong");
}

#[tokio::test]
async fn test_udp_pair_and_dial() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Udp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Udp).await;
    assert_ne!(a_id, b_id);

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Udp),
        b.request_info(a_id, DialMode::Udp)
    );
    let (a_info, b_info) = (a_info.unwrap(), b_info.unwrap());

    assert_eq!(a_info.peer.port, b.local_addr().port());
    assert_eq!(b_info.peer.port, a.local_addr().port());
    assert_eq!(a_info.own, Some(b_info.peer));
    assert_ne!(a_info.initiator, b_info.initiator);

    let (ca, cb) = tokio::join!(a.dial(), b.dial());
    exchange_udp(ca.unwrap(), cb.unwrap()).await;
}

#[tokio::test]
async fn test_stream_control_with_udp_dial() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Tcp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tcp).await;

    // a asks first and has to wait for b
    let pending = tokio::spawn(async move {
        let info = a.request_info(b_id, DialMode::Udp).await.map(|_| ());
        (a, info)
    });
    sleep(Duration::from_millis(300)).await;
    assert!(!pending.is_finished());

    b.request_info(a_id, DialMode::Udp).await.unwrap();
    let (mut a, info) = pending.await.unwrap();
    info.unwrap();

    let (ca, cb) = tokio::join!(a.dial(), b.dial());
    exchange_udp(ca.unwrap(), cb.unwrap()).await;
}

#[tokio::test]
async fn test_tcp_dial() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Tcp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tcp).await;
    a.set_port_delta(PortDelta::Fixed(0));
    b.set_port_delta(PortDelta::Fixed(0));

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Tcp),
        b.request_info(a_id, DialMode::Tcp)
    );
    let (a_info, b_info) = (a_info.unwrap(), b_info.unwrap());
    assert_ne!(a_info.initiator, b_info.initiator);
    assert_eq!(a_info.peer_port_delta, PortDelta::Fixed(0));

    let (ca, cb) = tokio::join!(a.dial(), b.dial());
    let (mut sa, mut sb) = match (ca.unwrap(), cb.unwrap()) {
        (Connection::Tcp(sa), Connection::Tcp(sb)) => (sa, sb),
        other => panic!("unexpected connections {:?}", other),
    };

    assert_eq!(sa.peer_addr().unwrap().port(), b.local_addr().port());
    assert_eq!(sb.peer_addr().unwrap().port(), a.local_addr().port());

    sa.write_all(b"hello").await.unwrap();
    let mut buf = [0; 5];
    sb.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    // both sessions are done, the server hangs up
    sleep(Duration::from_millis(300)).await;
    assert!(matches!(a.request_id().await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_tcp_dial_unpredictable_delta() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Tcp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tcp).await;
    a.set_port_delta(PortDelta::Unpredictable);
    b.set_port_delta(PortDelta::Fixed(0));

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Tcp),
        b.request_info(a_id, DialMode::Tcp)
    );
    a_info.unwrap();
    assert_eq!(b_info.unwrap().peer_port_delta, PortDelta::Unpredictable);

    assert!(matches!(a.dial().await, Err(Error::PortDeltaUnpredictable)));
    assert!(matches!(b.dial().await, Err(Error::PortDeltaUnpredictable)));
}

#[tokio::test]
async fn test_udp_dial_without_peer_times_out() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Udp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Udp).await;

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Udp),
        b.request_info(a_id, DialMode::Udp)
    );
    a_info.unwrap();
    b_info.unwrap();

    a.set_config(DialConfig {
        dial_timeout: Duration::from_millis(500),
        dial_interval: Duration::from_millis(100),
        ..DialConfig::default()
    });

    // b never dials back
    assert!(matches!(a.dial().await, Err(Error::DialTimeout)));
}

#[tokio::test]
async fn test_tcp_connect_budget_exhausted() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Tcp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tcp).await;
    a.set_port_delta(PortDelta::Fixed(0));
    b.set_port_delta(PortDelta::Fixed(0));

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Tcp),
        b.request_info(a_id, DialMode::Tcp)
    );
    let mut initiator = match (a_info.unwrap().initiator, b_info.unwrap().initiator) {
        (true, false) => a,
        (false, true) => b,
        other => panic!("unexpected initiators {:?}", other),
    };

    initiator.set_config(DialConfig {
        connect_attempts: 2,
        attempt_timeout: Duration::from_millis(200),
        attempt_backoff: Duration::from_millis(10),
        ..DialConfig::default()
    });

    // the listener side never listens, so every attempt is refused
    assert!(matches!(initiator.dial().await, Err(Error::ConnectionFailed)));
}

#[tokio::test]
async fn test_nat_check() {
    let (first, _first_shutdown) = start_server(Config::default()).await;
    let (second, _second_shutdown) = start_server(Config::default()).await;

    let check = Client::check_nat(&first, &second).await.unwrap();
    assert_eq!(check.first, check.second);
    assert!(check.supported());

    assert!(matches!(
        Client::check_nat(&first, &first).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_udp_request_port() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let mut client = Client::new(&addr, Protocol::Udp).await.unwrap();

    let port = client.request_port().await.unwrap();
    assert_eq!(port, client.local_addr().port());
}

#[tokio::test]
async fn test_id_request_twice() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, _) = identified(&addr, Protocol::Tcp).await;

    match a.request_id().await {
        Err(Error::Rejected(reason)) => assert_eq!(reason, "Unexpected id request"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_pairing_errors() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Tcp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tcp).await;
    let (mut c, _) = identified(&addr, Protocol::Tcp).await;
    for client in [&mut a, &mut b, &mut c] {
        client.set_port_delta(PortDelta::Fixed(0));
    }

    assert!(matches!(
        a.request_info(a_id, DialMode::Tcp).await,
        Err(Error::SelfPairing)
    ));
    assert!(matches!(
        a.request_info(SessionId::from([0; 6]), DialMode::Tcp).await,
        Err(Error::SessionNotFound)
    ));

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Tcp),
        b.request_info(a_id, DialMode::Tcp)
    );
    a_info.unwrap();
    b_info.unwrap();

    assert!(matches!(
        c.request_info(a_id, DialMode::Tcp).await,
        Err(Error::AlreadyPaired)
    ));
    assert!(c.info().is_none());
}

#[tokio::test]
async fn test_protocol_mismatch() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let (mut a, a_id) = identified(&addr, Protocol::Tcp).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tcp).await;
    a.set_port_delta(PortDelta::Fixed(0));

    let pending = tokio::spawn(async move { a.request_info(b_id, DialMode::Tcp).await.is_ok() });
    sleep(Duration::from_millis(300)).await;

    assert!(matches!(
        b.request_info(a_id, DialMode::Udp).await,
        Err(Error::ProtocolMismatch)
    ));
    pending.abort();
}

#[tokio::test]
async fn test_measure_port_delta() {
    let (addr, _shutdown) = start_server(Config::default()).await;
    let mut client = Client::new(&addr, Protocol::Tcp).await.unwrap();

    let delta = client.measure_port_delta().await.unwrap();
    assert_eq!(client.port_delta(), Some(delta));
}

#[tokio::test]
async fn test_retransmit_until_timeout() {
    let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = silent.local_addr().unwrap().to_string();
    let mut client = Client::new(&addr, Protocol::Udp).await.unwrap();

    let opts = RequestOptions {
        timeout: Duration::from_millis(500),
        retransmit: Some(Duration::from_millis(100)),
        channel: Channel::Control,
    };
    let res = client.request(MessageType::IdRequest, Vec::new(), opts).await;
    assert!(matches!(res, Err(Error::RequestTimeout)));

    let mut buf = [0; 64];
    let mut nonces = Vec::new();
    for _ in 0..3 {
        let (n, _) = silent.recv_from(&mut buf).await.unwrap();
        nonces.push(Message::decode(&buf[..n]).unwrap().nonce);
    }
    assert!(nonces.iter().all(|n| *n == nonces[0]));
}

#[tokio::test]
async fn test_lost_control_connection() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });
    let mut client = Client::new(&addr, Protocol::Tcp).await.unwrap();
    accept.await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert!(matches!(client.request_id().await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_shutdown() {
    let server = Server::new(Config {
        listen_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        ..Config::default()
    })
    .await
    .unwrap();

    let res = timeout(
        Duration::from_secs(5),
        server.run_until(sleep(Duration::from_millis(100))),
    )
    .await;
    assert!(matches!(res, Ok(Ok(()))));
}

#[cfg(feature = "tls")]
#[tokio::test]
async fn test_tls_control_channel() {
    use holepunch::tls::TlsIdentity;

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let config = Config {
        tls: Some(TlsIdentity {
            cert: cert.cert.pem().into_bytes(),
            key: cert.key_pair.serialize_pem().into_bytes(),
        }),
        ..Config::default()
    };
    let (addr, _shutdown) = start_server(config).await;

    let (mut a, a_id) = identified(&addr, Protocol::Tls).await;
    let (mut b, b_id) = identified(&addr, Protocol::Tls).await;

    let (a_info, b_info) = tokio::join!(
        a.request_info(b_id, DialMode::Udp),
        b.request_info(a_id, DialMode::Udp)
    );
    a_info.unwrap();
    b_info.unwrap();

    let (ca, cb) = tokio::join!(a.dial(), b.dial());
    exchange_udp(ca.unwrap(), cb.unwrap()).await;
}
