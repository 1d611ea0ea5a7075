//! Iterative resolution against external authoritative servers.
//!
//! Each client query gets its own [`Context`] carrying the depth budget and
//! the set of NS names already being chased, so referral graphs with cycles
//! terminate. Exchanges go over UDP first and retry over TCP on truncation.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::prelude::Error;
use crate::store::{Source, Store};

use super::hints::RootHints;

pub const MAX_DEPTH: usize = 10;
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_PORT: u16 = 53;
const UDP_BUFFER: usize = 4096;

/// Per-chain resolution state: depth budget plus cycle detection.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub depth: usize,
    visited: HashSet<String>,
}

impl Context {
    pub fn descend(&self) -> Self {
        Self {
            depth: self.depth + 1,
            visited: self.visited.clone(),
        }
    }

    /// Mark an NS name as being chased; returns false when it already is
    /// (a referral cycle).
    pub fn visit(&mut self, name: &str) -> bool {
        self.visited.insert(name.to_lowercase())
    }
}

#[derive(Clone)]
pub struct Resolver {
    store: Store,
    hints: std::sync::Arc<RootHints>,
    port: u16,
}

impl Resolver {
    pub fn new(store: Store, hints: std::sync::Arc<RootHints>) -> Self {
        Self {
            store,
            hints,
            port: DNS_PORT,
        }
    }

    /// Override the upstream port (default 53). Test servers bind
    /// unprivileged ports.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// One wire exchange with a server: UDP, retried over TCP when the
    /// answer comes back truncated. Hard 5 second timeout per transport.
    pub async fn exchange(msg: &Message, server: SocketAddr) -> Result<Message, Error> {
        let raw = msg.to_vec().map_err(Error::client)?;

        let response = timeout(EXCHANGE_TIMEOUT, Self::exchange_udp(&raw, server))
            .await
            .map_err(|_| Error::client("exchange timed out"))??;

        if !response.truncated() {
            return Ok(response);
        }

        trace!(%server, "truncated response, retrying over tcp");

        timeout(EXCHANGE_TIMEOUT, Self::exchange_tcp(&raw, server))
            .await
            .map_err(|_| Error::client("exchange timed out"))?
    }

    async fn exchange_udp(raw: &[u8], server: SocketAddr) -> Result<Message, Error> {
        let socket = match server {
            SocketAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").await?,
            SocketAddr::V6(_) => UdpSocket::bind("[::]:0").await?,
        };

        socket.send_to(raw, server).await?;

        let mut buf = vec![0u8; UDP_BUFFER];
        let (len, _) = socket.recv_from(&mut buf).await?;

        Message::from_vec(&buf[..len]).map_err(Error::client)
    }

    async fn exchange_tcp(raw: &[u8], server: SocketAddr) -> Result<Message, Error> {
        let mut stream = TcpStream::connect(server).await?;

        stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
        stream.write_all(raw).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;

        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await?;

        Message::from_vec(&buf).map_err(Error::client)
    }

    /// Resolve `msg` iteratively starting at `server`.
    ///
    /// Authoritative answers (and answers from recursive upstreams) are
    /// returned as-is; everything else is treated as a referral and chased
    /// with a descended context, at most [`MAX_DEPTH`] exchanges deep.
    pub async fn resolve(
        &self,
        msg: &Message,
        server: IpAddr,
        ctx: &mut Context,
    ) -> Result<Message, Error> {
        if ctx.depth >= MAX_DEPTH {
            return Err(Error::client("maximum resolution depth reached"));
        }

        let response = Self::exchange(msg, SocketAddr::new(server, self.port)).await?;

        if response.authoritative()
            || !msg.recursion_desired()
            || response.answer_count() > 0
        {
            return Ok(response);
        }

        // referral: the authority section names the next zone's servers
        let ns_names: Vec<String> = response
            .name_servers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::NS(ns) => Some(ns.0.to_ascii().to_lowercase()),
                _ => None,
            })
            .collect();

        if ns_names.is_empty() {
            return Ok(response);
        }

        let mut candidates: Vec<(String, Vec<IpAddr>)> = Vec::new();

        for ns_name in &ns_names {
            let glue: Vec<IpAddr> = response
                .additionals()
                .iter()
                .filter(|record| record.name().to_ascii().to_lowercase() == *ns_name)
                .filter_map(|record| match record.data() {
                    RData::A(a) => Some(IpAddr::V4(a.0)),
                    RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect();

            if !glue.is_empty() {
                candidates.push((ns_name.clone(), glue));
            }
        }

        // glue-less delegation: chase the NS names themselves
        if candidates.is_empty() {
            for ns_name in &ns_names {
                let mut descended = ctx.descend();

                if !descended.visit(ns_name) {
                    debug!(%ns_name, "referral cycle detected");
                    continue;
                }

                match self.resolve_ns(ns_name, &mut descended).await {
                    Ok(addresses) if !addresses.is_empty() => {
                        candidates.push((ns_name.clone(), addresses));
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%ns_name, error = %err, "ns resolution failed"),
                }
            }
        }

        let Some((ns_name, addresses)) = candidates.choose(&mut OsRng) else {
            return Err(Error::client("referral with no reachable name servers"));
        };

        let address = *addresses.choose(&mut OsRng).expect("non-empty addresses");

        debug!(%ns_name, %address, depth = ctx.depth, "following referral");

        let mut descended = ctx.descend();
        Box::pin(self.resolve(msg, address, &mut descended)).await
    }

    /// Find addresses for a glue-less NS name: the local stores first, then
    /// iterative resolution from a random root server.
    async fn resolve_ns(&self, ns_name: &str, ctx: &mut Context) -> Result<Vec<IpAddr>, Error> {
        let mut addresses = self.local_addresses(ns_name)?;

        if !addresses.is_empty() {
            return Ok(addresses);
        }

        let root = self
            .hints
            .random_address()
            .ok_or_else(|| Error::server("no root servers available"))?;

        let query = build_query(ns_name, RecordType::A)?;
        let response = Box::pin(self.resolve(&query, root, ctx)).await?;

        for record in response.answers() {
            match record.data() {
                RData::A(a) => addresses.push(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => addresses.push(IpAddr::V6(aaaa.0)),
                _ => {}
            }
        }

        Ok(addresses)
    }

    /// A/AAAA records for an owner out of the materialized stores, Cardano
    /// first.
    pub fn local_addresses(&self, owner: &str) -> Result<Vec<IpAddr>, Error> {
        for source in [Source::Cardano, Source::Handshake] {
            let records = self
                .store
                .lookup_records(source, &["A", "AAAA"], owner)?;

            let addresses: Vec<IpAddr> = records
                .iter()
                .filter_map(|record| record.rhs.parse().ok())
                .collect();

            if !addresses.is_empty() {
                return Ok(addresses);
            }
        }

        Ok(Vec::new())
    }
}

/// A recursion-desired query for one name and type.
pub fn build_query(name: &str, rtype: RecordType) -> Result<Message, Error> {
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::Name;

    let name = Name::from_ascii(name).map_err(Error::parse)?;

    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, rtype));

    Ok(msg)
}
