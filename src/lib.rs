//!A rendezvous server and client for NAT hole punching.
//!
//!Two peers behind NATs can't reach each other until each has sent traffic toward the
//!other's public address. A public rendezvous server observes the address and port each
//!client's connection arrives from, pairs two clients that name each other by session id,
//!and tells each one the other's contact. The peers then punch a direct path and confirm it
//!with the server.
//!
//!## How it works
//!1. A client connects over TCP, TLS or UDP and gets a random 6-byte session id.
//!2. Both clients ask to be paired with the other's id. Whoever asks first waits; once the
//!   second request arrives both receive the peer's contact.
//!3. **UDP**: both send DIAL datagrams to each other every second. The first DIAL from the
//!   peer proves the path; each side confirms with the server and gets its socket back.
//!4. **TCP**: the client measures how its NAT shifts external ports across consecutive
//!   connections, then one peer (the initiator) connects to the predicted address while the
//!   other listens on the port its control connection used.
//!
//!Both TCP paths need the control connection's local port to be reused, which depends on
//!SO_REUSEADDR and SO_REUSEPORT.
//!
//!## Feature flags
//!- `client`: [`client::Client`] with the UDP and TCP traversal
//!- `server`: [`server::Server`]
//!- `tls`: TLS control channel

pub mod error;
pub mod framing;
pub mod proto;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod tcp;
#[cfg(feature = "client")]
pub mod udp;

#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub mod session;

#[cfg(feature = "tls")]
pub mod tls;

pub use error::{Error, Result};

use tokio::task::JoinHandle;

/// Aborts the task when dropped.
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl AbortOnDrop {
    /// Abort and wait until the task is gone, so nothing it holds outlives this call.
    pub(crate) async fn cancel(mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
