//! DNS interception: upstream discovery, resolution and the query handler.

mod interceptor;
mod resolver;
mod upstream;

pub use interceptor::{DnsInterceptor, InterceptError};
pub use resolver::{ResolveError, ResolveFuture, Resolver, SystemResolver};
pub use upstream::{UpstreamError, discover_upstream, read_first_nameserver};

#[cfg(test)]
pub(crate) use resolver::testing;
