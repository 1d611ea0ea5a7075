//! End-to-end sync: a mock Handshake peer serves a two-block chain and the
//! pipeline materializes it into the store.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use cdnsd::handshake::block::Header;
use cdnsd::handshake::hash::Hash;
use cdnsd::handshake::network::MAINNET;
use cdnsd::handshake::pow;
use cdnsd::handshake::varint::write_varint;
use cdnsd::handshake::wire::{self, Message, MessageType, NetAddr, VersionMessage};
use cdnsd::store::Store;

/// An easy compact target (top byte 0x7f) so test headers mine in a couple
/// of nonce attempts.
const EASY_BITS: u32 = 0x207f_ffff;

fn mine_header(prev_block: Hash<32>, time: u64) -> Header {
    let mut header = Header {
        nonce: 0,
        time,
        prev_block,
        name_root: Hash::new([0x11; 32]),
        extra_nonce: [0; 24],
        reserved_root: Hash::zero(),
        witness_root: Hash::new([0x22; 32]),
        merkle_root: Hash::new([0x33; 32]),
        version: 0,
        bits: EASY_BITS,
        mask: [0; 32],
    };

    for nonce in 0..1_000_000 {
        header.nonce = nonce;
        if pow::validate(&header).is_ok() {
            return header;
        }
    }

    panic!("failed to mine a test header");
}

fn block_bytes(header: &Header) -> Vec<u8> {
    let mut raw = header.encode().to_vec();
    write_varint(&mut raw, 0);
    raw
}

async fn read_message(stream: &mut TcpStream) -> Message {
    loop {
        let (type_byte, payload) = wire::read_frame(stream, MAINNET.magic).await.unwrap();

        if let Some(message) = Message::decode(type_byte, &payload).unwrap() {
            return message;
        }
    }
}

async fn send(stream: &mut TcpStream, message: &Message) {
    wire::write_message(stream, MAINNET.magic, message).await.unwrap();
}

/// Speak the server side of the protocol: handshake, then serve a fixed
/// two-block chain.
async fn mock_peer(listener: TcpListener, headers: Vec<Header>) {
    let (mut stream, _) = listener.accept().await.unwrap();

    // version handshake, server side
    let Message::Version(_) = read_message(&mut stream).await else {
        panic!("expected version");
    };

    send(&mut stream, &Message::Verack).await;

    let version = VersionMessage {
        version: 1,
        services: 0,
        time: 0,
        remote: NetAddr {
            time: 0,
            services: 0,
            host: stream.peer_addr().unwrap().ip(),
            port: stream.peer_addr().unwrap().port(),
            key: [0u8; 33],
        },
        nonce: [9u8; 8],
        agent: "/mock/".into(),
        height: headers.len() as u32,
        no_relay: true,
    };
    send(&mut stream, &Message::Version(version)).await;

    let Message::Verack = read_message(&mut stream).await else {
        panic!("expected verack");
    };

    let mut served_batch = false;

    loop {
        match read_message(&mut stream).await {
            Message::SendHeaders => {}
            Message::GetAddr => {
                send(&mut stream, &Message::Addr(Vec::new())).await;
            }
            Message::GetHeaders { locator, .. } => {
                if served_batch {
                    send(&mut stream, &Message::Headers(Vec::new())).await;
                    continue;
                }

                assert_eq!(locator, vec![MAINNET.genesis_hash()]);
                send(&mut stream, &Message::Headers(headers.clone())).await;
                served_batch = true;
            }
            Message::GetData(items) => {
                let hash = items[0].hash;
                let header = headers
                    .iter()
                    .find(|header| header.hash() == hash)
                    .expect("unknown block requested");

                wire::write_frame(
                    &mut stream,
                    MAINNET.magic,
                    MessageType::Block,
                    &block_bytes(header),
                )
                .await
                .unwrap();
            }
            other => panic!("unexpected message from client: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_follows_a_mock_chain() {
    let b1 = mine_header(MAINNET.genesis_hash(), 1_700_000_001);
    let b2 = mine_header(b1.hash(), 1_700_000_002);
    let tip = b2.hash();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(mock_peer(listener, vec![b1, b2]));

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(
        dir.path().join("zones.redb"),
        "network=mainnet,network-magic=764824073",
    )
    .unwrap();

    let _tethers =
        cdnsd::sync::pipeline(addr.to_string(), MAINNET, store.clone(), None).unwrap();

    // wait for the apply stage to persist the tip cursor
    for _ in 0..100 {
        if store.handshake_cursor().unwrap().as_deref() == Some(tip.to_string().as_str()) {
            return;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    panic!(
        "cursor never reached the mock tip; at {:?}",
        store.handshake_cursor().unwrap()
    );
}
