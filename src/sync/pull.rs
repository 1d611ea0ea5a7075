//! Pull stage: supervises the Handshake peer and streams blocks downstream.
//!
//! One peer at a time. The worker dials, runs the version handshake and
//! walks the chain with explicit `GetHeaders`/`GetData` rounds until it
//! reaches the tip, then switches to unsolicited `Headers` pushes. A header
//! that does not extend the last known hash drops the worker back into
//! initial-sync mode without advancing the locator. Worker restarts go
//! through the gasket retry policy, which provides the reconnect backoff.

use gasket::framework::*;
use tracing::{debug, info, warn};

use crate::prelude::Error;

use crate::handshake::block::{Block, Header};
use crate::handshake::hash::Hash;
use crate::handshake::network::Network;
use crate::handshake::peer::Peer;
use crate::handshake::wire::MAX_HEADERS_PER_BATCH;
use crate::store::Store;

pub type DownstreamPort = gasket::messaging::OutputPort<PullEvent>;

#[derive(Clone)]
pub enum PullEvent {
    Block(Box<Block>),
}

pub enum WorkUnit {
    Pull,
    Await,
}

pub struct Worker {
    peer: Peer,
    locator: Hash<32>,
    reached_tip: bool,
}

impl Worker {
    async fn apply_batch(
        &mut self,
        headers: Vec<Header>,
        stage: &mut Stage,
    ) -> Result<(), WorkerError> {
        let full_batch = headers.len() >= MAX_HEADERS_PER_BATCH;

        for header in headers {
            if header.prev_block != self.locator {
                // the peer is on a different branch; fall back to initial
                // sync from the last hash we know, without advancing
                warn!(
                    prev = %header.prev_block,
                    known = %self.locator,
                    "header does not extend known chain"
                );

                self.reached_tip = false;
                return Ok(());
            }

            let hash = header.hash();
            let block = self.peer.get_block(hash).await.or_restart()?;

            stage
                .downstream
                .send(PullEvent::Block(block).into())
                .await
                .or_panic()?;

            stage.block_count.inc(1);
            self.locator = hash;
        }

        if !full_batch {
            if !self.reached_tip {
                info!(tip = %self.locator, "reached chain tip");
            }

            self.reached_tip = true;
        }

        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(stage: &Stage) -> Result<Self, WorkerError> {
        let locator = match stage.store.handshake_cursor().or_panic()? {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| Error::message("invalid handshake cursor"))
                .or_panic()?,
            None => stage.network.genesis_hash(),
        };

        debug!(%locator, peer = %stage.peer_address, "connecting to peer");

        let mut addrs = tokio::net::lookup_host(&stage.peer_address)
            .await
            .or_retry()?;

        let addr = addrs
            .next()
            .ok_or(Error::message("peer address did not resolve"))
            .or_retry()?;

        let mut peer = Peer::connect(addr, stage.network).await.or_retry()?;

        info!(
            agent = peer.remote_agent(),
            height = peer.remote_height(),
            "connected to peer"
        );

        stage.chain_height.set(peer.remote_height() as i64);

        // ask for tip announcements as Headers rather than Inv
        peer.send_headers_signal().await.or_restart()?;

        // address book sample, for operator visibility only
        match peer.get_peers().await {
            Ok(addrs) => debug!(count = addrs.len(), "peer address book"),
            Err(err) => debug!(error = %err, "peer address book unavailable"),
        }

        Ok(Self {
            peer,
            locator,
            reached_tip: false,
        })
    }

    async fn schedule(
        &mut self,
        _stage: &mut Stage,
    ) -> Result<WorkSchedule<WorkUnit>, WorkerError> {
        if self.reached_tip {
            Ok(WorkSchedule::Unit(WorkUnit::Await))
        } else {
            Ok(WorkSchedule::Unit(WorkUnit::Pull))
        }
    }

    async fn execute(&mut self, unit: &WorkUnit, stage: &mut Stage) -> Result<(), WorkerError> {
        match unit {
            WorkUnit::Pull => {
                let headers = self
                    .peer
                    .get_headers(vec![self.locator], Hash::zero())
                    .await
                    .or_restart()?;

                self.apply_batch(headers, stage).await?;
            }
            WorkUnit::Await => {
                let headers = self.peer.wait_headers().await.or_restart()?;
                self.apply_batch(headers, stage).await?;
            }
        }

        Ok(())
    }
}

#[derive(Stage)]
#[stage(name = "pull", unit = "WorkUnit", worker = "Worker")]
pub struct Stage {
    peer_address: String,
    network: Network,
    store: Store,

    pub downstream: DownstreamPort,

    #[metric]
    block_count: gasket::metrics::Counter,

    #[metric]
    chain_height: gasket::metrics::Gauge,
}

impl Stage {
    pub fn new(peer_address: String, network: Network, store: Store) -> Self {
        Self {
            peer_address,
            network,
            store,
            downstream: Default::default(),
            block_count: Default::default(),
            chain_height: Default::default(),
        }
    }
}
