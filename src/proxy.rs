//! Relays admitted flows to their real destinations.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::firewall::LOOPBACK_REDIRECT;
use crate::flow::{DatagramFlow, FlowStream};

/// A UDP relay stops reading from the destination after this long without
/// a datagram.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Dials the destination of each flow and pumps bytes both ways, one task
/// per direction. Each direction stops on its own at end-of-stream or on
/// the first I/O error.
#[derive(Debug, Clone)]
pub struct ConnectionProxy {
    mtu: usize,
    udp_idle_timeout: Duration,
}

impl ConnectionProxy {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
        }
    }

    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    /// Where a flow to `destination` is actually dialled. The loopback
    /// redirect address maps to the host's own loopback.
    pub fn dial_target(destination: SocketAddr) -> SocketAddr {
        if destination.ip() == IpAddr::V4(LOOPBACK_REDIRECT) {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), destination.port())
        } else {
            destination
        }
    }

    /// Proxies a TCP stream to `destination`. If the dial fails the sandbox
    /// side is closed.
    pub async fn proxy_tcp(&self, destination: SocketAddr, client: Box<dyn FlowStream>) {
        let target = Self::dial_target(destination);
        let upstream = match TcpStream::connect(target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!("failed to connect to {}: {}", target, e);
                return;
            }
        };
        debug!("proxying TCP flow to {}", target);

        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = upstream.into_split();

        tokio::spawn(pump(client_read, upstream_write, target, "sandbox -> world"));
        tokio::spawn(pump(upstream_read, client_write, target, "world -> sandbox"));
    }

    /// Proxies a datagram flow to its destination over a fresh UDP socket.
    pub async fn proxy_udp(&self, flow: Arc<dyn DatagramFlow>) {
        let target = Self::dial_target(flow.local_addr());
        let bind_addr: SocketAddr = if target.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("failed to open UDP socket for {}: {}", target, e);
                return;
            }
        };
        if let Err(e) = socket.connect(target).await {
            debug!("failed to connect UDP socket to {}: {}", target, e);
            return;
        }
        debug!("proxying UDP flow to {}", target);

        let socket = Arc::new(socket);
        let mtu = self.mtu;

        let outbound_socket = Arc::clone(&socket);
        let outbound_flow = Arc::clone(&flow);
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu];
            loop {
                let len = match outbound_flow.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(e) => {
                        debug!("UDP sandbox -> {} stopped: {}", target, e);
                        return;
                    }
                };
                if let Err(e) = outbound_socket.send(&buf[..len]).await {
                    debug!("UDP sandbox -> {} stopped: {}", target, e);
                    return;
                }
            }
        });

        let idle = self.udp_idle_timeout;
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu];
            loop {
                let len = match tokio::time::timeout(idle, socket.recv(&mut buf)).await {
                    Ok(Ok(len)) => len,
                    Ok(Err(e)) => {
                        debug!("UDP {} -> sandbox stopped: {}", target, e);
                        return;
                    }
                    Err(_) => {
                        debug!("UDP {} -> sandbox idle for {:?}", target, idle);
                        return;
                    }
                };
                if let Err(e) = flow.send(&buf[..len]).await {
                    debug!("UDP {} -> sandbox stopped: {}", target, e);
                    return;
                }
            }
        });
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, target: SocketAddr, direction: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            debug!("{} ({}) closed after {} bytes", direction, target, bytes);
            let _ = writer.shutdown().await;
        }
        Err(e) => debug!("{} ({}) stopped: {}", direction, target, e),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::flow::testing::ChannelFlow;

    #[test]
    fn loopback_redirect_dials_localhost() {
        let redirected = ConnectionProxy::dial_target(SocketAddr::new(IpAddr::V4(LOOPBACK_REDIRECT), 8000));
        assert_eq!(redirected, "127.0.0.1:8000".parse().unwrap());

        let plain: SocketAddr = "203.0.113.5:443".parse().unwrap();
        assert_eq!(ConnectionProxy::dial_target(plain), plain);
    }

    /// Tests that bytes are relayed in both directions and a half-close
    /// from the sandbox reaches the destination.
    #[tokio::test]
    async fn tcp_relays_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(b"pong").await.unwrap();
            request
        });

        let (ours, mut theirs) = tokio::io::duplex(1024);
        ConnectionProxy::new(1500)
            .proxy_tcp(target, Box::new(ours))
            .await;

        theirs.write_all(b"ping").await.unwrap();
        theirs.shutdown().await.unwrap();
        let mut reply = Vec::new();
        theirs.read_to_end(&mut reply).await.unwrap();

        assert_eq!(server.await.unwrap(), b"ping");
        assert_eq!(reply, b"pong");
    }

    /// Tests that a failed dial closes the sandbox side.
    #[tokio::test]
    async fn tcp_dial_failure_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let (ours, mut theirs) = tokio::io::duplex(1024);
        ConnectionProxy::new(1500)
            .proxy_tcp(target, Box::new(ours))
            .await;

        let mut buf = Vec::new();
        assert_eq!(theirs.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn udp_relays_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..len].to_vec();
            reply.reverse();
            server.send_to(&reply, peer).await.unwrap();
        });

        let (flow, mut peer) = ChannelFlow::new("10.1.1.100:5000".parse().unwrap(), target);
        ConnectionProxy::new(1500).proxy_udp(flow).await;

        peer.tx.send(b"abc".to_vec()).unwrap();
        assert_eq!(peer.rx.recv().await.unwrap(), b"cba");
    }
}
