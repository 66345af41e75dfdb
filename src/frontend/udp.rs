use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::flow::{DatagramFlow, IoFuture};
use crate::mux::Mux;

/// Datagrams queued per source before new ones are dropped.
const FLOW_QUEUE: usize = 64;

/// A source that stays silent this long is forgotten.
pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// UDP socket receiving redirected DNS queries.
///
/// Each source address becomes one [`DatagramFlow`] reporting `destination`
/// (the DNS server the sandbox believes it is querying) as its local
/// address. Replies are sent back to the source from this socket.
pub struct DnsListener {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    mtu: usize,
    idle_timeout: Duration,
}

impl DnsListener {
    pub async fn bind(addr: SocketAddr, destination: SocketAddr, mtu: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(
            "DNS frontend listening on {} (as {})",
            socket.local_addr()?,
            destination
        );
        Ok(Self {
            socket: Arc::new(socket),
            destination,
            mtu,
            idle_timeout: FLOW_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Demultiplexes datagrams into per-source flows until receiving fails.
    pub async fn run(self, mux: Arc<Mux>) -> io::Result<()> {
        let mut flows: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut buf = vec![0u8; self.mtu];

        loop {
            let (len, source) = self.socket.recv_from(&mut buf).await?;
            let datagram = buf[..len].to_vec();

            if let Some(tx) = flows.get(&source) {
                match tx.try_send(datagram) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("queue for {} is full, dropping datagram", source);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(datagram)) => {
                        flows.remove(&source);
                        self.open_flow(&mut flows, &mux, source, datagram);
                    }
                }
            } else {
                self.open_flow(&mut flows, &mux, source, datagram);
            }
        }
    }

    fn open_flow(
        &self,
        flows: &mut HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
        mux: &Mux,
        source: SocketAddr,
        first: Vec<u8>,
    ) {
        flows.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        // Cannot fail: the channel is empty and the receiver is alive.
        let _ = tx.try_send(first);
        flows.insert(source, tx);

        debug!("new UDP flow from {} to {}", source, self.destination);
        mux.notify_udp(Arc::new(SourceFlow {
            socket: Arc::clone(&self.socket),
            source,
            destination: self.destination,
            idle_timeout: self.idle_timeout,
            inbound: Mutex::new(rx),
        }));
    }
}

/// Datagrams from one source, as seen through the shared socket.
struct SourceFlow {
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    destination: SocketAddr,
    idle_timeout: Duration,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl DatagramFlow for SourceFlow {
    fn local_addr(&self) -> SocketAddr {
        self.destination
    }

    fn remote_addr(&self) -> SocketAddr {
        self.source
    }

    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            let mut inbound = self.inbound.lock().await;
            let datagram = tokio::time::timeout(self.idle_timeout, inbound.recv())
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let len = datagram.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram[..len]);
            Ok(len)
        })
    }

    fn send<'a>(&'a self, buf: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move { self.socket.send_to(buf, self.source).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::Resolver;
    use crate::dns::testing::StaticResolver;
    use crate::firewall::{Firewall, RuleSet};

    fn mux() -> Arc<Mux> {
        let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new());
        Arc::new(Mux::new(Arc::new(Firewall::new(&RuleSet::unrestricted(), resolver))))
    }

    /// Tests that datagrams from one source share a flow that reports the
    /// DNS server as its destination, and replies go back to that source.
    #[tokio::test]
    async fn one_flow_per_source() {
        let mux = mux();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        mux.handle_udp(":53", move |flow| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(flow.local_addr());
                let mut buf = [0u8; 64];
                while let Ok(len) = flow.recv(&mut buf).await {
                    let _ = flow.send(&buf[..len]).await;
                }
            }
        });

        let dns_server: SocketAddr = "192.0.2.53:53".parse().unwrap();
        let listener = DnsListener::bind("127.0.0.1:0".parse().unwrap(), dns_server, 1500)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run(Arc::clone(&mux)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        for payload in [&b"one"[..], &b"two"[..]] {
            client.send_to(payload, addr).await.unwrap();
            let (len, from) = client.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], payload);
            assert_eq!(from, addr);
        }

        assert_eq!(seen_rx.recv().await.unwrap(), dns_server);
        assert!(seen_rx.try_recv().is_err());
    }

    /// Tests that an idle flow times out and a later datagram opens a new one.
    #[tokio::test]
    async fn idle_flow_is_replaced() {
        let mux = mux();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        mux.handle_udp("*", move |flow| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(());
                let mut buf = [0u8; 64];
                while let Ok(len) = flow.recv(&mut buf).await {
                    let _ = flow.send(&buf[..len]).await;
                }
            }
        });

        let listener = DnsListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            "10.1.1.1:53".parse().unwrap(),
            1500,
        )
        .await
        .unwrap()
        .with_idle_timeout(Duration::from_millis(50));
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run(Arc::clone(&mux)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];

        client.send_to(b"a", addr).await.unwrap();
        client.recv_from(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.send_to(b"b", addr).await.unwrap();
        client.recv_from(&mut buf).await.unwrap();

        seen_rx.recv().await.unwrap();
        seen_rx.recv().await.unwrap();
    }
}
