//! DNS front-end: UDP, TCP and optional TLS listeners over one handler.
//!
//! The handler answers from the materialized zones first (Cardano, then
//! Handshake), falls back to the longest indexed delegation, and finally to
//! iterative resolution seeded by the root hints.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, NS, NULL, TXT};
use hickory_proto::rr::{Name, RData, Record as DnsRecord, RecordType};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServeConfig;
use crate::prelude::Error;
use crate::store::{Record, Source, Store};

pub mod hints;
pub mod resolver;
mod tls;

use hints::RootHints;
use resolver::{build_query, Context, Resolver};

/// TTL substituted for records stored with an unspecified (zero) TTL.
const DEFAULT_TTL: u32 = 300;

/// Overall budget for one client query, including recursion.
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Driver;

impl Driver {
    pub async fn run(
        config: ServeConfig,
        store: Store,
        exit: CancellationToken,
    ) -> Result<(), Error> {
        let hints = Arc::new(RootHints::load(&config.dns)?);

        let handler = Arc::new(QueryHandler {
            resolver: Resolver::new(store.clone(), hints.clone()),
            store,
            hints,
            recursion: config.dns.recursion,
        });

        let udp = Arc::new(UdpSocket::bind(config.dns.listen_address).await?);
        let tcp = TcpListener::bind(config.dns.listen_address).await?;

        info!(address = %config.dns.listen_address, "dns listening (udp/tcp)");

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(udp_loop(
            udp.clone(),
            handler.clone(),
            exit.clone(),
        )));

        tasks.push(tokio::spawn(tcp_loop(tcp, handler.clone(), exit.clone())));

        if let Some(tls_config) = &config.tls {
            let listener = TcpListener::bind(tls_config.listen_address).await?;
            let acceptor = tls::acceptor(tls_config)?;

            info!(address = %tls_config.listen_address, "dns listening (tls)");

            tasks.push(tokio::spawn(tls::tls_loop(
                listener,
                acceptor,
                handler.clone(),
                exit.clone(),
            )));
        }

        for task in tasks {
            task.await.map_err(Error::server)??;
        }

        Ok(())
    }
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
    exit: CancellationToken,
) -> Result<(), Error> {
    let mut buf = vec![0u8; 4096];

    loop {
        let (len, remote) = tokio::select! {
            received = socket.recv_from(&mut buf) => received?,
            _ = exit.cancelled() => return Ok(()),
        };

        let raw = buf[..len].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Some(response) = handler.handle_raw(&raw).await {
                if let Err(err) = socket.send_to(&response, remote).await {
                    debug!(error = %err, "udp reply failed");
                }
            }
        });
    }
}

async fn tcp_loop(
    listener: TcpListener,
    handler: Arc<QueryHandler>,
    exit: CancellationToken,
) -> Result<(), Error> {
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = exit.cancelled() => return Ok(()),
        };

        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(err) = serve_stream(stream, handler).await {
                debug!(%remote, error = %err, "tcp session ended");
            }
        });
    }
}

/// Serve length-prefixed DNS messages on a stream transport until EOF.
pub(crate) async fn serve_stream<S>(mut stream: S, handler: Arc<QueryHandler>) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }

        let mut raw = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut raw).await?;

        if let Some(response) = handler.handle_raw(&raw).await {
            stream
                .write_all(&(response.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&response).await?;
            stream.flush().await?;
        }
    }
}

pub struct QueryHandler {
    store: Store,
    resolver: Resolver,
    hints: Arc<RootHints>,
    recursion: bool,
}

impl QueryHandler {
    async fn handle_raw(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(raw) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "undecodable query");
                return None;
            }
        };

        metrics::counter!("dns_query_total").increment(1);

        let response = match tokio::time::timeout(QUERY_TIMEOUT, self.handle(&request)).await {
            Ok(response) => response,
            Err(_) => {
                debug!("query timed out");
                failure(&request, ResponseCode::ServFail)
            }
        };

        response.to_vec().ok()
    }

    /// Answer one request. `aa` is set on local data, `rd` is echoed and
    /// `ra` reflects our recursion setting.
    pub async fn handle(&self, request: &Message) -> Message {
        let Some(query) = request.queries().first() else {
            return failure(request, ResponseCode::FormErr);
        };

        let owner = query.name().to_ascii().to_lowercase();
        let rtype = query.query_type();

        debug!(%owner, %rtype, "query");

        // 1. direct hit in the materialized zones
        if let Some(records) = self.lookup_direct(&owner, rtype) {
            let mut response = reply_to(request, self.recursion);
            response.set_authoritative(true);
            response.add_answers(records);
            return response;
        }

        // 2./3. longest indexed delegation, referral or recursion
        if let Some((zone, ns_records)) = self.find_delegation(&owner) {
            debug!(%zone, "serving from indexed delegation");
            return self.serve_delegation(request, &ns_records).await;
        }

        // 4. no indexed suffix: the root hints become the delegation and
        // are served the same way
        let root_ns = self.hints.as_ns_records();
        if !root_ns.is_empty() {
            return self.serve_delegation(request, &root_ns).await;
        }

        failure(request, ResponseCode::NXDomain)
    }

    /// The requested type (plus CNAME for address queries) for the exact
    /// owner, Cardano store first.
    fn lookup_direct(&self, owner: &str, rtype: RecordType) -> Option<Vec<DnsRecord>> {
        let type_string = rtype.to_string();
        let mut types = vec![type_string.as_str()];

        if matches!(rtype, RecordType::A | RecordType::AAAA) {
            types.push("CNAME");
        }

        for source in [Source::Cardano, Source::Handshake] {
            let records = match self.store.lookup_records(source, &types, owner) {
                Ok(records) => records,
                Err(err) => {
                    warn!(error = %err, "store lookup failed");
                    return None;
                }
            };

            if !records.is_empty() {
                let converted: Vec<DnsRecord> =
                    records.iter().filter_map(to_dns_record).collect();

                if !converted.is_empty() {
                    return Some(converted);
                }
            }
        }

        None
    }

    /// Walk the owner's label suffixes, longest first, for an indexed NS
    /// set.
    fn find_delegation(&self, owner: &str) -> Option<(String, Vec<Record>)> {
        let mut candidate = owner.trim_end_matches('.').to_string();

        loop {
            let zone = format!("{candidate}.");

            for source in [Source::Cardano, Source::Handshake] {
                match self.store.lookup_records(source, &["NS"], &zone) {
                    Ok(records) if !records.is_empty() => {
                        return Some((zone, records));
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "store lookup failed"),
                }
            }

            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest.to_string(),
                _ => return None,
            }
        }
    }

    /// Serve an indexed delegation: referral for non-recursive clients,
    /// full recursion otherwise.
    async fn serve_delegation(&self, request: &Message, ns_records: &[Record]) -> Message {
        let glue = self.gather_glue(ns_records).await;

        if !self.recursion || !request.recursion_desired() {
            let mut response = reply_to(request, self.recursion);
            response.add_name_servers(ns_records.iter().filter_map(to_dns_record));
            response.add_additionals(glue.iter().flat_map(|(_, records)| records.iter().cloned()));
            return response;
        }

        // IPv4 preferred, IPv6 only when no A glue exists at all
        let v4: Vec<std::net::IpAddr> = glue
            .iter()
            .flat_map(|(addrs, _)| addrs.iter())
            .filter(|addr| addr.is_ipv4())
            .copied()
            .collect();

        let v6: Vec<std::net::IpAddr> = glue
            .iter()
            .flat_map(|(addrs, _)| addrs.iter())
            .filter(|addr| addr.is_ipv6())
            .copied()
            .collect();

        let pool = if v4.is_empty() { v6 } else { v4 };

        let Some(address) = pool.choose(&mut OsRng).copied() else {
            debug!("delegation with no resolvable name servers");
            return failure(request, ResponseCode::ServFail);
        };

        self.forward(request, address).await
    }

    /// Addresses plus additional-section records for each delegated NS:
    /// local stores first, the root-hint set, then iterative resolution.
    async fn gather_glue(
        &self,
        ns_records: &[Record],
    ) -> Vec<(Vec<std::net::IpAddr>, Vec<DnsRecord>)> {
        let mut out = Vec::new();

        for ns in ns_records {
            let target = ns.rhs.trim_end_matches('.').to_string() + ".";

            let mut addresses = match self.resolver.local_addresses(&target) {
                Ok(addresses) => addresses,
                Err(err) => {
                    warn!(error = %err, "glue lookup failed");
                    Vec::new()
                }
            };

            if addresses.is_empty() {
                addresses = self.hints.addresses_for(&target);
            }

            if addresses.is_empty() && self.recursion {
                if let Ok(query) = build_query(&target, RecordType::A) {
                    if let Some(root) = self.hints.random_address() {
                        let mut ctx = Context::default();
                        if let Ok(response) = self.resolver.resolve(&query, root, &mut ctx).await {
                            for record in response.answers() {
                                match record.data() {
                                    RData::A(a) => addresses.push(std::net::IpAddr::V4(a.0)),
                                    RData::AAAA(aaaa) => {
                                        addresses.push(std::net::IpAddr::V6(aaaa.0))
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }

            let records = addresses
                .iter()
                .filter_map(|address| {
                    let name = Name::from_ascii(&target).ok()?;
                    let rdata = match address {
                        std::net::IpAddr::V4(v4) => RData::A(A(*v4)),
                        std::net::IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
                    };
                    Some(DnsRecord::from_rdata(name, DEFAULT_TTL, rdata))
                })
                .collect();

            out.push((addresses, records));
        }

        out
    }

    /// Forward the client's question to one server as a full iterative
    /// query and shape its outcome into our reply.
    async fn forward(&self, request: &Message, server: std::net::IpAddr) -> Message {
        let mut ctx = Context::default();

        match self.resolver.resolve(request, server, &mut ctx).await {
            Ok(upstream) => {
                let mut response = reply_to(request, self.recursion);
                response.set_response_code(upstream.response_code());
                response.add_answers(upstream.answers().iter().cloned());
                response.add_name_servers(upstream.name_servers().iter().cloned());
                response.add_additionals(upstream.additionals().iter().cloned());
                response
            }
            Err(err) => {
                debug!(error = %err, "recursion failed");
                failure(request, ResponseCode::ServFail)
            }
        }
    }
}

/// An empty response frame echoing the request's id, opcode and rd flag.
fn reply_to(request: &Message, recursion_available: bool) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(recursion_available);
    response.set_response_code(ResponseCode::NoError);

    for query in request.queries() {
        response.add_query(query.clone());
    }

    response
}

fn failure(request: &Message, code: ResponseCode) -> Message {
    let mut response = reply_to(request, false);
    response.set_response_code(code);
    response
}

/// Convert a stored record into a wire record. Unrepresentable values are
/// dropped with a log line rather than poisoning the whole answer.
fn to_dns_record(record: &Record) -> Option<DnsRecord> {
    let name = Name::from_ascii(&record.lhs).ok()?;
    let ttl = if record.ttl == 0 {
        DEFAULT_TTL
    } else {
        record.ttl
    };

    let rdata = match record.rtype.as_str() {
        "A" => RData::A(A(record.rhs.parse().ok()?)),
        "AAAA" => RData::AAAA(AAAA(record.rhs.parse().ok()?)),
        "NS" => RData::NS(NS(Name::from_ascii(&record.rhs).ok()?)),
        "CNAME" => RData::CNAME(hickory_proto::rr::rdata::CNAME(
            Name::from_ascii(&record.rhs).ok()?,
        )),
        "TXT" => {
            let items: Vec<String> = record
                .rhs
                .split('"')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.to_string())
                .collect();
            RData::TXT(TXT::new(items))
        }
        "DS" => {
            // key-tag, algorithm, digest-type, hex digest → raw rdata
            let mut fields = record.rhs.split_whitespace();
            let key_tag: u16 = fields.next()?.parse().ok()?;
            let algorithm: u8 = fields.next()?.parse().ok()?;
            let digest_type: u8 = fields.next()?.parse().ok()?;
            let digest = hex::decode(fields.next()?).ok()?;

            let mut raw = Vec::with_capacity(4 + digest.len());
            raw.extend_from_slice(&key_tag.to_be_bytes());
            raw.push(algorithm);
            raw.push(digest_type);
            raw.extend_from_slice(&digest);

            RData::Unknown {
                code: RecordType::DS.into(),
                rdata: NULL::with(raw),
            }
        }
        other => {
            debug!(rtype = other, "unrepresentable record type");
            return None;
        }
    };

    Some(DnsRecord::from_rdata(name, ttl, rdata))
}
