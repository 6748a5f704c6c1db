use holepunch::client::{Client, Connection, DialMode};
use holepunch::proto::{PortDelta, Protocol};
use holepunch::server::{Config, Server};
use std::error::Error;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let server = Server::new(Config {
        listen_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        ..Config::default()
    })
    .await?;
    let server_addr = server.local_addr()?.to_string();
    tokio::spawn(server.run());

    let mut c1 = Client::new(&server_addr, Protocol::Tcp).await?;
    let mut c2 = Client::new(&server_addr, Protocol::Tcp).await?;
    // loopback keeps ports as they are
    c1.set_port_delta(PortDelta::Fixed(0));
    c2.set_port_delta(PortDelta::Fixed(0));

    let id1 = c1.request_id().await?;
    let id2 = c2.request_id().await?;
    let (r1, r2) = tokio::join!(
        c1.request_info(id2, DialMode::Tcp),
        c2.request_info(id1, DialMode::Tcp)
    );
    r1?;
    r2?;

    let (d1, d2) = tokio::join!(c1.dial(), c2.dial());
    if let (Connection::Tcp(mut s1), Connection::Tcp(mut s2)) = (d1?, d2?) {
        s1.write_all(b"hello").await?;
        let mut buf = [0; 5];
        s2.read_exact(&mut buf).await?;
        println!(
            "{} -> {}: {}",
            s1.local_addr()?,
            s2.local_addr()?,
            String::from_utf8_lossy(&buf)
        );
    }

    Ok(())
}
