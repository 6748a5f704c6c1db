use holepunch::client::{Client, Connection, DialMode};
use holepunch::proto::Protocol;
use holepunch::server::{Config, Server};
use std::error::Error;
use std::net::Ipv4Addr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let server = Server::new(Config {
        listen_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        ..Config::default()
    })
    .await?;
    let server_addr = server.local_addr()?.to_string();
    tokio::spawn(server.run());

    let mut c1 = Client::new(&server_addr, Protocol::Udp).await?;
    let mut c2 = Client::new(&server_addr, Protocol::Udp).await?;
    let id1 = c1.request_id().await?;
    let id2 = c2.request_id().await?;

    let (r1, r2) = tokio::join!(
        c1.request_info(id2, DialMode::Udp),
        c2.request_info(id1, DialMode::Udp)
    );
    r1?;
    r2?;

    let (d1, d2) = tokio::join!(c1.dial(), c2.dial());
    if let (Connection::Udp { socket, peer }, Connection::Udp { .. }) = (d1?, d2?) {
        socket.send_to(b"hello", peer).await?;
        println!("{} -> {}", socket.local_addr()?, peer);
    }

    Ok(())
}
