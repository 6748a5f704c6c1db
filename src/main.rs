use holepunch::client::{Client, Connection, DialMode};
use holepunch::proto::{Protocol, SessionId, DEFAULT_PORT};
use holepunch::server::{Config, Server};
use holepunch::Result;
use std::net::IpAddr;
#[cfg(feature = "tls")]
use std::path::PathBuf;
use structopt::StructOpt;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

#[derive(StructOpt, Debug)]
#[structopt(name = "holepunch")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
    /// Check whether the network allows UDP hole punching, using two servers.
    Check(CheckOpt),
}

#[derive(StructOpt, Debug)]
struct CheckOpt {
    /// host or host:port, given twice
    #[structopt(long = "server-addr", required = true, number_of_values = 1)]
    server_addrs: Vec<String>,
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-addr", env = "SERVER_ADDRESS")]
    server_addr: String,

    #[structopt(long = "server-port", env = "SERVER_PORT", default_value = "12435")]
    server_port: u16,

    /// tcp, tls or udp
    #[structopt(long, env = "PROTOCOL", default_value = "tcp")]
    protocol: Protocol,

    /// udp or tcp
    #[structopt(long, default_value = "udp")]
    mode: DialMode,

    /// Peer session id; read from stdin when missing.
    #[structopt(long)]
    peer: Option<SessionId>,

    /// Measure the port delta before pairing.
    #[structopt(long)]
    measure: bool,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", env = "ADDRESS", default_value = "0.0.0.0")]
    listen_addr: IpAddr,

    #[structopt(long, env = "PORT", default_value = "12435")]
    port: u16,

    #[structopt(long = "no-udp")]
    no_udp: bool,

    #[structopt(long = "no-tcp")]
    no_tcp: bool,

    #[cfg(feature = "tls")]
    #[structopt(long, requires = "key")]
    cert: Option<PathBuf>,

    #[cfg(feature = "tls")]
    #[structopt(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let res = match Opt::from_args() {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Client(opt) => run_client(opt).await,
        Opt::Check(opt) => run_check(opt).await,
    };

    if let Err(e) = res {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    #[allow(unused_mut)]
    let mut config = Config {
        listen_addr: (opt.listen_addr, opt.port).into(),
        stream: !opt.no_tcp,
        datagram: !opt.no_udp,
        ..Default::default()
    };

    #[cfg(feature = "tls")]
    if let (Some(cert), Some(key)) = (&opt.cert, &opt.key) {
        config.tls = Some(holepunch::tls::TlsIdentity {
            cert: std::fs::read(cert)?,
            key: std::fs::read(key)?,
        });
    }

    let server = Server::new(config).await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn run_client(opt: ClientOpt) -> Result<()> {
    let server_addr = format!("{}:{}", opt.server_addr, opt.server_port);
    let mut client = Client::new(&server_addr, opt.protocol).await?;

    if opt.measure {
        let delta = client.measure_port_delta().await?;
        log::info!("port delta {:?}", delta);
    }

    let sid = client.request_id().await?;
    log::info!("session id {}", sid);
    println!("{}", sid);

    let peer = match opt.peer {
        Some(peer) => peer,
        None => read_peer().await?,
    };

    let info = client.request_info(peer, opt.mode).await?;
    log::info!(
        "peer {} at {}, we are {}",
        peer,
        info.peer,
        info.own.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
    );

    match client.dial().await? {
        Connection::Udp { socket, peer } => {
            log::info!("udp {} <-> {}", socket.local_addr()?, peer)
        }
        Connection::Tcp(stream) => log::info!(
            "tcp {} <-> {}",
            stream.local_addr()?,
            stream.peer_addr()?
        ),
    }

    Ok(())
}

async fn run_check(opt: CheckOpt) -> Result<()> {
    let (first, second) = match &opt.server_addrs[..] {
        [first, second] => (with_port(first), with_port(second)),
        _ => {
            return Err(holepunch::Error::InvalidArgument(
                "expected --server-addr twice".into(),
            ))
        }
    };

    let check = Client::check_nat(&first, &second).await?;
    if check.supported() {
        log::info!("public port {} is the same across servers", check.first);
        log::info!("UDP hole punching is supported");
    } else {
        log::warn!(
            "public ports differ across servers ({} and {})",
            check.first,
            check.second
        );
        log::warn!("UDP hole punching isn't supported on this network");
    }

    Ok(())
}

fn with_port(addr: &str) -> String {
    match addr.contains(':') {
        true => addr.to_string(),
        false => format!("{}:{}", addr, DEFAULT_PORT),
    }
}

async fn read_peer() -> Result<SessionId> {
    let mut line = String::new();
    BufReader::new(stdin()).read_line(&mut line).await?;
    line.parse()
}
