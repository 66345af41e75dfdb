//! Routes intercepted flows to handlers by destination pattern.
//!
//! Patterns: `"*"` matches everything, `":<port>"` matches any address
//! ending in that port, anything else must equal the destination exactly.
//! Entries are tried in registration order and the first match wins. The
//! firewall then decides whether the flow is dispatched at all; denied or
//! unmatched flows are dropped without any answer. Entries registered with
//! [`Mux::handle_udp_uncounted`] are checked against the allowlist only and
//! never consume a counting-mode admission.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::firewall::Firewall;
use crate::flow::{DatagramFlow, FlowRequest, FlowStream};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TcpHandler = Arc<dyn Fn(Box<dyn FlowRequest>) -> BoxFuture + Send + Sync>;
type UdpHandler = Arc<dyn Fn(Arc<dyn DatagramFlow>) -> BoxFuture + Send + Sync>;

/// Backlog of accepted flows waiting in a [`TcpFlowListener`].
const LISTENER_BACKLOG: usize = 64;

struct Entry<H> {
    pattern: String,
    handler: H,
    counted: bool,
}

pub struct Mux {
    firewall: Arc<Firewall>,
    tcp: Mutex<Vec<Entry<TcpHandler>>>,
    udp: Mutex<Vec<Entry<UdpHandler>>>,
}

impl Mux {
    pub fn new(firewall: Arc<Firewall>) -> Self {
        Self {
            firewall,
            tcp: Mutex::new(Vec::new()),
            udp: Mutex::new(Vec::new()),
        }
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    /// Registers a handler that receives the unanswered request and decides
    /// itself whether to accept or reject it.
    pub fn handle_tcp_request<F, Fut>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(Box<dyn FlowRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pattern = pattern.into();
        debug!("registering TCP handler for {}", pattern);
        let handler: TcpHandler =
            Arc::new(move |request: Box<dyn FlowRequest>| -> BoxFuture { Box::pin(handler(request)) });
        lock(&self.tcp).push(Entry {
            pattern,
            handler,
            counted: true,
        });
    }

    /// Registers a handler for accepted streams. The handler gets the
    /// flow's destination and the established stream.
    pub fn handle_tcp<F, Fut>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(SocketAddr, Box<dyn FlowStream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.handle_tcp_request(pattern, move |request| {
            let handler = Arc::clone(&handler);
            async move {
                let destination = request.local_addr();
                match request.accept().await {
                    Ok(stream) => handler(destination, stream).await,
                    Err(e) => debug!("failed to accept flow to {}: {}", destination, e),
                }
            }
        });
    }

    pub fn handle_udp<F, Fut>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(Arc<dyn DatagramFlow>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_udp(pattern.into(), handler, true);
    }

    /// Registers a UDP handler whose flows do not count against the
    /// connection limit. Allowlist membership is still checked.
    pub fn handle_udp_uncounted<F, Fut>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(Arc<dyn DatagramFlow>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_udp(pattern.into(), handler, false);
    }

    fn push_udp<F, Fut>(&self, pattern: String, handler: F, counted: bool)
    where
        F: Fn(Arc<dyn DatagramFlow>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("registering UDP handler for {} (counted: {})", pattern, counted);
        let handler: UdpHandler =
            Arc::new(move |flow: Arc<dyn DatagramFlow>| -> BoxFuture { Box::pin(handler(flow)) });
        lock(&self.udp).push(Entry {
            pattern,
            handler,
            counted,
        });
    }

    /// Accepts flows matching `pattern` and queues them for
    /// [`TcpFlowListener::accept`].
    pub fn listen_tcp(&self, pattern: impl Into<String>) -> TcpFlowListener {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        self.handle_tcp(pattern, move |destination, stream| {
            let tx = tx.clone();
            async move {
                if tx.send((stream, destination)).await.is_err() {
                    debug!("listener closed, dropping flow to {}", destination);
                }
            }
        });
        TcpFlowListener { rx }
    }

    /// Dispatches a new TCP flow request. Returns immediately; matching
    /// handlers run on their own task.
    pub fn notify_tcp(&self, request: Box<dyn FlowRequest>) {
        let destination = request.local_addr();
        let Some((handler, _)) = first_match(&lock(&self.tcp), &destination) else {
            debug!(
                "no TCP route for {} from {}, dropping",
                destination,
                request.remote_addr()
            );
            return;
        };

        let firewall = Arc::clone(&self.firewall);
        tokio::spawn(async move {
            if !firewall.allow(destination.ip()).await {
                debug!("TCP flow to {} denied, dropping", destination);
                return;
            }
            handler(request).await;
        });
    }

    /// Dispatches a new UDP flow. Returns immediately.
    pub fn notify_udp(&self, flow: Arc<dyn DatagramFlow>) {
        let destination = flow.local_addr();
        let Some((handler, counted)) = first_match(&lock(&self.udp), &destination) else {
            debug!(
                "no UDP route for {} from {}, dropping",
                destination,
                flow.remote_addr()
            );
            return;
        };

        let firewall = Arc::clone(&self.firewall);
        tokio::spawn(async move {
            let allowed = if counted {
                firewall.allow(destination.ip()).await
            } else {
                firewall.allow_uncounted(destination.ip()).await
            };
            if !allowed {
                debug!("UDP flow to {} denied, dropping", destination);
                return;
            }
            handler(flow).await;
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn first_match<H: Clone>(entries: &[Entry<H>], destination: &SocketAddr) -> Option<(H, bool)> {
    let address = destination.to_string();
    entries
        .iter()
        .find(|entry| pattern_matches(&entry.pattern, &address))
        .map(|entry| (entry.handler.clone(), entry.counted))
}

fn pattern_matches(pattern: &str, address: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.starts_with(':') {
        return address.ends_with(pattern);
    }
    pattern == address
}

/// Stream of accepted flows registered through [`Mux::listen_tcp`].
pub struct TcpFlowListener {
    rx: mpsc::Receiver<(Box<dyn FlowStream>, SocketAddr)>,
}

impl TcpFlowListener {
    /// Waits for the next accepted flow and its destination. Returns `None`
    /// once the mux has been dropped.
    pub async fn accept(&mut self) -> Option<(Box<dyn FlowStream>, SocketAddr)> {
        self.rx.recv().await
    }
}
