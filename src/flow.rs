//! Stack-agnostic view of intercepted flows.
//!
//! Whatever captures the sandbox's traffic (a userspace TCP/IP stack, or
//! the host-socket adapters in [`crate::frontend`]) hands flows to the
//! multiplexer through these traits.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Established byte stream for one TCP flow.
pub trait FlowStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> FlowStream for T {}

/// A TCP connection attempt that has not been answered yet.
///
/// Dropping a request without calling [`accept`](FlowRequest::accept) or
/// [`reject`](FlowRequest::reject) leaves the attempt unanswered: the
/// sandboxed client sees a connection that never completes.
pub trait FlowRequest: Send {
    /// The sandboxed client's address.
    fn remote_addr(&self) -> SocketAddr;

    /// The destination the client was trying to reach.
    fn local_addr(&self) -> SocketAddr;

    /// Completes the handshake and returns the stream. On error the flow is
    /// unusable.
    fn accept(self: Box<Self>) -> IoFuture<'static, Box<dyn FlowStream>>;

    /// Refuses the connection.
    fn reject(self: Box<Self>);
}

/// One logical UDP flow between a sandboxed source and a destination.
/// Sends are routed back to the source.
pub trait DatagramFlow: Send + Sync {
    /// The destination the source was sending to.
    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Receives the next datagram from the source.
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize>;

    /// Sends one datagram to the source.
    fn send<'a>(&'a self, buf: &'a [u8]) -> IoFuture<'a, usize>;
}
