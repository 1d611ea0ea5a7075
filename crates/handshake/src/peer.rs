//! A single Handshake peer session.
//!
//! A session lives from a successful dial until the first fatal frame,
//! decode or protocol error. Inbound messages are dispatched into bounded
//! per-type channels by a background receive task; requests are a send
//! paired with a time-bounded receive on the matching channel, racing the
//! session's done signal. Once shut down a session cannot be reused.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::block::{Block, Header};
use crate::hash::{sha3_256, Hash};
use crate::network::Network;
use crate::proof::Proof;
use crate::wire::{self, Message, NetAddr, VersionMessage, WireError};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const PROTOCOL_VERSION: u32 = 1;
const USER_AGENT: &str = "/cdnsd/";
const CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("dial timed out")]
    DialTimeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("unexpected message during {0}")]
    UnexpectedMessage(&'static str),

    #[error("request timed out")]
    RequestTimeout,

    #[error("connection has shut down")]
    ShutDown,
}

struct Channels {
    addr_rx: mpsc::Receiver<Vec<NetAddr>>,
    headers_rx: mpsc::Receiver<Vec<Header>>,
    block_rx: mpsc::Receiver<Box<Block>>,
    proof_rx: mpsc::Receiver<ProofResponse>,
}

struct ChannelSenders {
    addr_tx: mpsc::Sender<Vec<NetAddr>>,
    headers_tx: mpsc::Sender<Vec<Header>>,
    block_tx: mpsc::Sender<Box<Block>>,
    proof_tx: mpsc::Sender<ProofResponse>,
}

pub struct ProofResponse {
    pub root: Hash<32>,
    pub key: Hash<32>,
    pub proof: Proof,
}

pub struct Peer {
    network: Network,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    done: CancellationToken,
    fatal: Arc<StdMutex<Option<String>>>,
    channels: Channels,
    remote_version: VersionMessage,
}

impl Drop for Peer {
    fn drop(&mut self) {
        // stops the receive loop task when the session owner goes away
        self.done.cancel();
    }
}

impl Peer {
    /// Dial a peer and run the version handshake.
    pub async fn connect(addr: SocketAddr, network: Network) -> Result<Self, PeerError> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::DialTimeout)??;

        Self::from_stream(stream, network).await
    }

    /// Run the version handshake over an already-established connection.
    pub async fn from_stream(mut stream: TcpStream, network: Network) -> Result<Self, PeerError> {
        let remote_addr = stream.peer_addr()?;

        let local_version = build_version(remote_addr);
        wire::write_message(&mut stream, network.magic, &Message::Version(local_version)).await?;

        expect_verack(&mut stream, network).await?;
        let remote_version = expect_version(&mut stream, network).await?;

        wire::write_message(&mut stream, network.magic, &Message::Verack).await?;

        debug!(
            agent = %remote_version.agent,
            height = remote_version.height,
            "handshake complete"
        );

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let done = CancellationToken::new();
        let fatal = Arc::new(StdMutex::new(None));

        let (addr_tx, addr_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (headers_tx, headers_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (proof_tx, proof_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(receive_loop(
            read_half,
            writer.clone(),
            network,
            done.clone(),
            fatal.clone(),
            ChannelSenders {
                addr_tx,
                headers_tx,
                block_tx,
                proof_tx,
            },
        ));

        Ok(Self {
            network,
            writer,
            done,
            fatal,
            channels: Channels {
                addr_rx,
                headers_rx,
                block_rx,
                proof_rx,
            },
            remote_version,
        })
    }

    pub fn remote_agent(&self) -> &str {
        &self.remote_version.agent
    }

    pub fn remote_height(&self) -> u32 {
        self.remote_version.height
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Shut the session down. Idempotent; all pending and future waits
    /// return [`PeerError::ShutDown`].
    pub fn close(&self) {
        self.done.cancel();
    }

    fn shutdown_error(&self) -> PeerError {
        if let Some(reason) = self.fatal.lock().expect("poisoned lock").as_ref() {
            warn!(%reason, "session closed by receive loop");
        }

        PeerError::ShutDown
    }

    async fn send(&self, message: Message) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(self.shutdown_error());
        }

        let mut writer = self.writer.lock().await;
        wire::write_message(&mut *writer, self.network.magic, &message)
            .await
            .map_err(PeerError::from)
    }

    /// Ask the peer to announce new tips as `Headers` pushes.
    pub async fn send_headers_signal(&self) -> Result<(), PeerError> {
        self.send(Message::SendHeaders).await
    }

    /// GetAddr/Addr round trip.
    pub async fn get_peers(&mut self) -> Result<Vec<NetAddr>, PeerError> {
        self.send(Message::GetAddr).await?;

        let done = self.done.clone();
        recv_response(&mut self.channels.addr_rx, &done, Some(REQUEST_TIMEOUT)).await
    }

    /// Request a batch of headers starting after the locator.
    pub async fn get_headers(
        &mut self,
        locator: Vec<Hash<32>>,
        stop: Hash<32>,
    ) -> Result<Vec<Header>, PeerError> {
        self.send(Message::GetHeaders { locator, stop }).await?;

        let done = self.done.clone();
        recv_response(&mut self.channels.headers_rx, &done, Some(REQUEST_TIMEOUT)).await
    }

    /// Wait for an unsolicited `Headers` push (tip following). No timeout;
    /// resolves when the peer announces a tip or the session shuts down.
    pub async fn wait_headers(&mut self) -> Result<Vec<Header>, PeerError> {
        let done = self.done.clone();
        recv_response(&mut self.channels.headers_rx, &done, None).await
    }

    /// Fetch one full block by hash.
    pub async fn get_block(&mut self, hash: Hash<32>) -> Result<Box<Block>, PeerError> {
        self.send(Message::GetData(vec![wire::InvItem {
            inv_type: wire::INV_BLOCK,
            hash,
        }]))
        .await?;

        let done = self.done.clone();
        recv_response(&mut self.channels.block_rx, &done, Some(REQUEST_TIMEOUT)).await
    }

    /// Request an SPV proof for `name` against the given tree root. The
    /// proof key is `sha3_256(name)`.
    pub async fn get_proof(&mut self, name: &str, root: Hash<32>) -> Result<Proof, PeerError> {
        let key = sha3_256(name.as_bytes());

        self.send(Message::GetProof { root, key }).await?;

        let done = self.done.clone();
        let response: ProofResponse =
            recv_response(&mut self.channels.proof_rx, &done, Some(REQUEST_TIMEOUT)).await?;

        if response.root != root || response.key != key {
            return Err(PeerError::UnexpectedMessage("proof request"));
        }

        Ok(response.proof)
    }
}

fn build_version(remote: SocketAddr) -> VersionMessage {
    let mut nonce = [0u8; 8];
    OsRng.fill_bytes(&mut nonce);

    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    VersionMessage {
        version: PROTOCOL_VERSION,
        services: 0,
        time,
        remote: NetAddr {
            time,
            services: 0,
            host: remote.ip(),
            port: remote.port(),
            key: [0u8; 33],
        },
        nonce,
        agent: USER_AGENT.into(),
        height: 0,
        no_relay: true,
    }
}

async fn read_message(stream: &mut TcpStream, network: Network) -> Result<Message, PeerError> {
    loop {
        let (type_byte, payload) = wire::read_frame(stream, network.magic).await?;

        if let Some(message) = Message::decode(type_byte, &payload)? {
            return Ok(message);
        }

        trace!(type_byte, "discarding unknown frame during handshake");
    }
}

async fn expect_verack(stream: &mut TcpStream, network: Network) -> Result<(), PeerError> {
    match timeout(HANDSHAKE_TIMEOUT, read_message(stream, network))
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??
    {
        Message::Verack => Ok(()),
        _ => Err(PeerError::UnexpectedMessage("verack wait")),
    }
}

async fn expect_version(
    stream: &mut TcpStream,
    network: Network,
) -> Result<VersionMessage, PeerError> {
    match timeout(HANDSHAKE_TIMEOUT, read_message(stream, network))
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??
    {
        Message::Version(version) => Ok(version),
        _ => Err(PeerError::UnexpectedMessage("version wait")),
    }
}

/// Wait for a response on a typed channel, racing the done signal and an
/// optional timeout.
async fn recv_response<T>(
    rx: &mut mpsc::Receiver<T>,
    done: &CancellationToken,
    wait: Option<Duration>,
) -> Result<T, PeerError> {
    let recv = async {
        tokio::select! {
            item = rx.recv() => item.ok_or(PeerError::ShutDown),
            _ = done.cancelled() => Err(PeerError::ShutDown),
        }
    };

    match wait {
        Some(duration) => timeout(duration, recv)
            .await
            .map_err(|_| PeerError::RequestTimeout)?,
        None => recv.await,
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    network: Network,
    done: CancellationToken,
    fatal: Arc<StdMutex<Option<String>>>,
    senders: ChannelSenders,
) {
    loop {
        let frame = tokio::select! {
            frame = wire::read_frame(&mut reader, network.magic) => frame,
            _ = done.cancelled() => return,
        };

        let (type_byte, payload) = match frame {
            Ok(frame) => frame,
            Err(err) => {
                abort(&done, &fatal, err.to_string());
                return;
            }
        };

        let message = match Message::decode(type_byte, &payload) {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!(type_byte, "discarding unknown message type");
                continue;
            }
            Err(err) => {
                abort(&done, &fatal, err.to_string());
                return;
            }
        };

        let result = dispatch(message, &writer, network, &senders, &done).await;

        if let Err(reason) = result {
            abort(&done, &fatal, reason);
            return;
        }
    }
}

async fn dispatch(
    message: Message,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    network: Network,
    senders: &ChannelSenders,
    done: &CancellationToken,
) -> Result<(), String> {
    match message {
        Message::Ping(nonce) => {
            let mut writer = writer.lock().await;
            wire::write_message(&mut *writer, network.magic, &Message::Pong(nonce))
                .await
                .map_err(|err| err.to_string())?;
        }
        Message::Pong(_) => trace!("pong"),
        Message::Addr(addrs) => {
            forward(&senders.addr_tx, addrs, done).await?;
        }
        Message::Headers(headers) => {
            forward(&senders.headers_tx, headers, done).await?;
        }
        Message::Block(block) => {
            forward(&senders.block_tx, block, done).await?;
        }
        Message::Proof { root, key, proof } => {
            forward(
                &senders.proof_tx,
                ProofResponse {
                    root,
                    key,
                    proof: *proof,
                },
                done,
            )
            .await?;
        }
        other => {
            // requests and stray handshake messages from the remote side
            debug!(message_type = ?other.message_type(), "ignoring inbound message");
        }
    }

    Ok(())
}

/// Push into a bounded channel; blocks (back-pressure) until the consumer
/// reads or the session shuts down.
async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    done: &CancellationToken,
) -> Result<(), String> {
    tokio::select! {
        sent = tx.send(item) => sent.map_err(|_| "consumer dropped".to_string()),
        _ = done.cancelled() => Ok(()),
    }
}

fn abort(done: &CancellationToken, fatal: &Arc<StdMutex<Option<String>>>, reason: String) {
    debug!(%reason, "peer session aborting");
    *fatal.lock().expect("poisoned lock") = Some(reason);
    done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MAINNET;
    use tokio::net::TcpListener;

    /// Accept one connection and complete the server side of the version
    /// handshake.
    async fn accept_and_handshake(listener: TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();

        let message = read_message(&mut stream, MAINNET).await.unwrap();
        assert!(matches!(message, Message::Version(_)));

        wire::write_message(&mut stream, MAINNET.magic, &Message::Verack)
            .await
            .unwrap();

        let version = build_version(stream.peer_addr().unwrap());
        wire::write_message(&mut stream, MAINNET.magic, &Message::Version(version))
            .await
            .unwrap();

        let message = read_message(&mut stream, MAINNET).await.unwrap();
        assert!(matches!(message, Message::Verack));

        stream
    }

    async fn connected_pair() -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(accept_and_handshake(listener));
        let peer = Peer::connect(addr, MAINNET).await.unwrap();
        let stream = server.await.unwrap();

        (peer, stream)
    }

    #[tokio::test]
    async fn handshake_and_headers_request() {
        let (mut peer, mut remote) = connected_pair().await;

        assert_eq!(peer.remote_agent(), USER_AGENT);

        let server = tokio::spawn(async move {
            let message = read_message(&mut remote, MAINNET).await.unwrap();
            assert!(matches!(message, Message::GetHeaders { .. }));

            wire::write_message(&mut remote, MAINNET.magic, &Message::Headers(Vec::new()))
                .await
                .unwrap();

            remote
        });

        let headers = peer
            .get_headers(vec![MAINNET.genesis_hash()], Hash::zero())
            .await
            .unwrap();

        assert!(headers.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn pings_are_answered_inline() {
        let (_peer, mut remote) = connected_pair().await;

        wire::write_message(&mut remote, MAINNET.magic, &Message::Ping(12345))
            .await
            .unwrap();

        let message = read_message(&mut remote, MAINNET).await.unwrap();
        assert!(matches!(message, Message::Pong(12345)));
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let (mut peer, _remote) = connected_pair().await;

        tokio::time::pause();

        // no response ever arrives; paused time skips to the deadline
        let result = peer.get_peers().await;
        assert!(matches!(result, Err(PeerError::RequestTimeout)));
    }

    #[tokio::test]
    async fn remote_disconnect_shuts_the_session_down() {
        let (mut peer, remote) = connected_pair().await;

        drop(remote);

        // the receive loop hits EOF and cancels the session
        let result = peer.wait_headers().await;
        assert!(matches!(result, Err(PeerError::ShutDown)));
        assert!(peer.is_closed());

        // a closed session refuses further use
        let result = peer.get_peers().await;
        assert!(matches!(result, Err(PeerError::ShutDown)));
    }

    #[tokio::test]
    async fn proof_response_with_mismatched_key_is_rejected() {
        let (mut peer, mut remote) = connected_pair().await;

        let root = Hash::new([0x11; 32]);

        let server = tokio::spawn(async move {
            let message = read_message(&mut remote, MAINNET).await.unwrap();
            let Message::GetProof { root, .. } = message else {
                panic!("expected GetProof");
            };

            // reply for the wrong key
            let mut raw = Vec::new();
            raw.extend_from_slice(&0u16.to_le_bytes());
            raw.extend_from_slice(&0u16.to_le_bytes());

            let mut payload = Vec::new();
            payload.extend_from_slice(root.as_slice());
            payload.extend_from_slice(&[0xee; 32]);
            payload.extend_from_slice(&raw);

            wire::write_frame(
                &mut remote,
                MAINNET.magic,
                wire::MessageType::Proof,
                &payload,
            )
            .await
            .unwrap();

            remote
        });

        let result = peer.get_proof("trees", root).await;
        assert!(matches!(
            result,
            Err(PeerError::UnexpectedMessage("proof request"))
        ));

        server.await.unwrap();
    }
}
