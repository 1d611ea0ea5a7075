//! The iterative resolver stays bounded when every upstream answer is a
//! referral back into the same delegation.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, NS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

use cdnsd::serve::dns::hints::RootHints;
use cdnsd::serve::dns::resolver::{build_query, Context, Resolver, MAX_DEPTH};
use cdnsd::store::Store;

/// Answer every query with the same glued referral: `a.` is served by
/// `ns1.a.`/`ns2.a.`, both of which point right back at this server.
async fn cyclic_referral_server(socket: UdpSocket, queries: Arc<AtomicUsize>) {
    let mut buf = vec![0u8; 4096];

    loop {
        let (len, remote) = socket.recv_from(&mut buf).await.unwrap();
        queries.fetch_add(1, Ordering::SeqCst);

        let request = Message::from_vec(&buf[..len]).unwrap();

        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);

        for query in request.queries() {
            response.add_query(query.clone());
        }

        let zone = Name::from_ascii("a.").unwrap();

        for ns in ["ns1.a.", "ns2.a."] {
            let ns_name = Name::from_ascii(ns).unwrap();

            response.add_name_server(Record::from_rdata(
                zone.clone(),
                300,
                RData::NS(NS(ns_name.clone())),
            ));

            response.add_additional(Record::from_rdata(
                ns_name,
                300,
                RData::A(A(Ipv4Addr::LOCALHOST)),
            ));
        }

        socket.send_to(&response.to_vec().unwrap(), remote).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_referrals_terminate_within_the_depth_budget() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    let queries = Arc::new(AtomicUsize::new(0));
    tokio::spawn(cyclic_referral_server(socket, queries.clone()));

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("zones.redb"), "network=test,magic=0").unwrap();

    let hints = RootHints::parse(". 1 NS X.\nX. 1 A 127.0.0.1\n").unwrap();
    let resolver = Resolver::new(store, Arc::new(hints)).with_port(port);

    let query = build_query("www.a.", RecordType::A).unwrap();
    let mut ctx = Context::default();

    let result = resolver
        .resolve(&query, IpAddr::V4(Ipv4Addr::LOCALHOST), &mut ctx)
        .await;

    // the chain must end in an error, after at most MAX_DEPTH exchanges
    assert!(result.is_err());
    assert!(queries.load(Ordering::SeqCst) <= MAX_DEPTH);
}
