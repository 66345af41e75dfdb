use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{getsockopt, setsockopt, sockopt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::flow::{FlowRequest, FlowStream, IoFuture};
use crate::mux::Mux;

/// How long an unanswered connection is held open before it is closed.
pub const UNANSWERED_HOLD: Duration = Duration::from_secs(120);

/// TCP listener receiving connections redirected by netfilter.
///
/// The destination each client originally dialled is recovered with
/// `SO_ORIGINAL_DST`; connections that were not redirected report the
/// listener's own address.
pub struct RedirectListener {
    listener: TcpListener,
}

impl RedirectListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP frontend listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Hands every accepted connection to the mux until accepting fails.
    pub async fn run(self, mux: Arc<Mux>) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let destination = match original_destination(&stream) {
                Ok(destination) => destination,
                Err(e) => {
                    debug!("dropping connection from {}: {}", peer, e);
                    continue;
                }
            };
            debug!("redirected connection from {} to {}", peer, destination);
            mux.notify_tcp(Box::new(RedirectedRequest {
                stream: Some(stream),
                peer,
                destination,
            }));
        }
    }
}

fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    match getsockopt(stream, sockopt::OriginalDst) {
        Ok(sin) => Ok(socket_addr_of(&sin)),
        Err(e) => {
            debug!("no original destination ({}), using local address", e);
            stream.local_addr()
        }
    }
}

fn socket_addr_of(sin: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

/// A redirected connection, already established on the host side.
///
/// The kernel completed the handshake before the mux saw the request, so a
/// dropped request cannot go unanswered at the TCP level. Instead the socket
/// is held open for [`UNANSWERED_HOLD`], discarding whatever the peer sends,
/// and the sandbox sees a connection that never responds.
struct RedirectedRequest {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    destination: SocketAddr,
}

impl FlowRequest for RedirectedRequest {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.destination
    }

    fn accept(mut self: Box<Self>) -> IoFuture<'static, Box<dyn FlowStream>> {
        let stream = self.stream.take();
        Box::pin(async move {
            let stream = stream.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            Ok(Box::new(stream) as Box<dyn FlowStream>)
        })
    }

    fn reject(mut self: Box<Self>) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        // Linger 0 turns the close into an RST.
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        if let Err(e) = setsockopt(&stream, sockopt::Linger, &linger) {
            debug!("failed to reset connection from {}: {}", self.peer, e);
        }
    }
}

impl Drop for RedirectedRequest {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(
            "holding unanswered connection from {} to {}",
            self.peer, self.destination
        );
        runtime.spawn(hold_unanswered(stream, UNANSWERED_HOLD));
    }
}

/// Reads and discards until the peer closes, the socket fails, or `hold`
/// elapses.
async fn hold_unanswered(mut stream: TcpStream, hold: Duration) {
    let mut buf = [0u8; 512];
    let drain = async {
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(hold, drain).await;
}
