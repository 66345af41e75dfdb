//! Answers DNS queries from the sandbox.
//!
//! A queries are gated by the firewall and resolved locally; every address
//! handed out is bound back into the firewall so the follow-up connection
//! is admitted. AAAA queries are resolved locally without gating. All other
//! record types are forwarded to the upstream server.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{RData, Record, RecordType, rdata};
use thiserror::Error;
use tracing::{debug, warn};

use super::resolver::Resolver;
use crate::firewall::{Firewall, LOOPBACK_REDIRECT, LOOPBACK_REDIRECT_NAME, fqdn};
use crate::flow::DatagramFlow;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("malformed DNS message: {0}")]
    Malformed(#[source] ProtoError),
    #[error("unsupported opcode {0:?}")]
    UnsupportedOpCode(OpCode),
    #[error("failed to encode DNS message: {0}")]
    Encode(#[source] ProtoError),
}

/// TTL of locally synthesized answers, in seconds.
pub const ANSWER_TTL: u32 = 3600;

pub struct DnsInterceptor {
    firewall: Arc<Firewall>,
    resolver: Arc<dyn Resolver>,
}

impl DnsInterceptor {
    pub fn new(firewall: Arc<Firewall>, resolver: Arc<dyn Resolver>) -> Self {
        Self { firewall, resolver }
    }

    /// Handles one query datagram and returns the reply datagram.
    ///
    /// Returns `None` for input that does not parse or whose opcode is not
    /// a standard query; no reply must be sent in that case. Resolution
    /// failures and questionless queries still produce a reply, with an
    /// empty answer section.
    pub async fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match parse_query(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping DNS datagram: {}", e);
                return None;
            }
        };
        let query = request.queries().first().cloned();
        let answers = match &query {
            Some(query) => self.answer(&request, query).await,
            None => {
                debug!("DNS query {} carries no question", request.id());
                Vec::new()
            }
        };

        match build_reply(&request, query, answers) {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    async fn answer(&self, request: &Message, query: &Query) -> Vec<Record> {
        let name = query.name().to_ascii();
        let record_type = query.query_type();
        debug!("{} query for {}", record_type, name);

        match record_type {
            RecordType::A => self.answer_a(query, &name).await,
            RecordType::AAAA => self.answer_aaaa(query, &name).await,
            _ => self.forward(request, query).await,
        }
    }

    async fn answer_a(&self, query: &Query, name: &str) -> Vec<Record> {
        if !self.firewall.allow_domain_query(name) {
            debug!("A query for {} denied by firewall", name);
            // Record the attempt without touching the allowed set.
            self.firewall.bind(name, &[]);
            return Vec::new();
        }

        let addresses: Vec<Ipv4Addr> = if fqdn(name) == LOOPBACK_REDIRECT_NAME {
            vec![LOOPBACK_REDIRECT]
        } else {
            match self.resolver.lookup_ipv4(name).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    debug!("resolving {} failed: {}", name, e);
                    return Vec::new();
                }
            }
        };

        let bound: Vec<IpAddr> = addresses.iter().copied().map(IpAddr::V4).collect();
        self.firewall.bind(name, &bound);

        addresses
            .into_iter()
            .map(|ip| Record::from_rdata(query.name().clone(), ANSWER_TTL, RData::A(rdata::A(ip))))
            .collect()
    }

    async fn answer_aaaa(&self, query: &Query, name: &str) -> Vec<Record> {
        match self.resolver.lookup_ipv6(name).await {
            Ok(addresses) => addresses
                .into_iter()
                .map(|ip| {
                    Record::from_rdata(query.name().clone(), ANSWER_TTL, RData::AAAA(rdata::AAAA(ip)))
                })
                .collect(),
            Err(e) => {
                debug!("resolving {} (AAAA) failed: {}", name, e);
                Vec::new()
            }
        }
    }

    /// Forwards a single-question copy of the query upstream and returns
    /// its answer section as-is.
    async fn forward(&self, request: &Message, query: &Query) -> Vec<Record> {
        let mut upstream_query = request.clone();
        upstream_query.take_queries();
        upstream_query.add_query(query.clone());

        let bytes = match upstream_query.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}", InterceptError::Encode(e));
                return Vec::new();
            }
        };

        let response = match self.resolver.exchange(&bytes).await {
            Ok(response) => response,
            Err(e) => {
                debug!("forwarding {} query failed: {}", query.query_type(), e);
                return Vec::new();
            }
        };

        match Message::from_vec(&response) {
            Ok(mut message) => message.take_answers(),
            Err(e) => {
                debug!("upstream returned {}", InterceptError::Malformed(e));
                Vec::new()
            }
        }
    }

    /// Serves every datagram of `flow`, one task per query, until the flow
    /// fails to receive.
    pub async fn serve(self: Arc<Self>, flow: Arc<dyn DatagramFlow>, mtu: usize) {
        let mut buf = vec![0u8; mtu];
        loop {
            let len = match flow.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    debug!("DNS flow from {} closed: {}", flow.remote_addr(), e);
                    return;
                }
            };
            let packet = buf[..len].to_vec();
            let interceptor = Arc::clone(&self);
            let flow = Arc::clone(&flow);
            tokio::spawn(async move {
                let Some(reply) = interceptor.handle(&packet).await else {
                    return;
                };
                // One reply is one datagram.
                if let Err(e) = flow.send(&reply).await {
                    debug!("failed to send DNS reply to {}: {}", flow.remote_addr(), e);
                }
            });
        }
    }
}

fn parse_query(packet: &[u8]) -> Result<Message, InterceptError> {
    let message = Message::from_vec(packet).map_err(InterceptError::Malformed)?;
    if message.op_code() != OpCode::Query {
        return Err(InterceptError::UnsupportedOpCode(message.op_code()));
    }
    Ok(message)
}

fn build_reply(
    request: &Message,
    query: Option<Query>,
    answers: Vec<Record>,
) -> Result<Vec<u8>, InterceptError> {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_checking_disabled(request.checking_disabled());
    if let Some(query) = query {
        reply.add_query(query);
    }
    reply.add_answers(answers);
    reply.to_vec().map_err(InterceptError::Encode)
}
