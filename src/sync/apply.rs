//! Apply stage: validates each pulled block and materializes its covenant
//! effects into the store.
//!
//! Per block: chain continuity against the last applied hash, proof of
//! work, then a walk over every output covenant. `Open`/`Claim` register
//! the raw name under its name-hash; `Register`/`Update` replace the
//! domain's zone; everything else leaves the store untouched. The cursor is
//! persisted after the block's effects, so a crash in between replays the
//! block on restart.

use gasket::framework::*;
use gasket::messaging::Message;
use tracing::{debug, info, warn};

use crate::handshake::block::Block;
use crate::handshake::covenant::TypedCovenant;
use crate::handshake::hash::Hash;
use crate::handshake::pow;
use crate::handshake::resource::Resource;
use crate::prelude::Error;
use crate::store::{Source, Store};
use crate::sync::records::records_for_domain;

use super::pull::PullEvent;

pub type UpstreamPort = gasket::messaging::InputPort<PullEvent>;

pub enum WorkUnit {
    Block(Box<Block>),
}

impl From<Message<PullEvent>> for WorkUnit {
    fn from(value: Message<PullEvent>) -> Self {
        match value.payload {
            PullEvent::Block(block) => WorkUnit::Block(block),
        }
    }
}

pub struct Worker {
    last_applied: Option<Hash<32>>,
}

impl Worker {
    fn apply_covenants(&self, block: &Block, stage: &Stage) -> Result<(), Error> {
        for tx in &block.transactions {
            for output in &tx.outputs {
                if !output.covenant.is_name_covenant() {
                    continue;
                }

                let typed = output
                    .covenant
                    .typed()
                    .map_err(|err| Error::parse(format!("covenant in {}: {err}", tx.id())))?;

                match typed {
                    TypedCovenant::Open {
                        name_hash, name, ..
                    }
                    | TypedCovenant::Claim {
                        name_hash, name, ..
                    } => {
                        let name = String::from_utf8_lossy(&name).into_owned();
                        debug!(%name_hash, %name, "name observed");
                        stage.store.put_name(name_hash.as_slice(), &name)?;
                    }
                    TypedCovenant::Register {
                        name_hash,
                        resource,
                        ..
                    }
                    | TypedCovenant::Update {
                        name_hash,
                        resource,
                        ..
                    } => {
                        let name = stage
                            .store
                            .lookup_name_by_hash(name_hash.as_slice())?
                            .ok_or_else(|| {
                                Error::message(format!("unknown name hash {name_hash}"))
                            })?;

                        let records = if resource.is_empty() {
                            Vec::new()
                        } else {
                            let resource = Resource::decode(&resource)
                                .map_err(|err| Error::parse(format!("resource: {err}")))?;
                            records_for_domain(&name, &resource)
                        };

                        info!(
                            domain = %name,
                            records = records.len(),
                            "zone update from chain"
                        );

                        stage
                            .store
                            .replace_zone(Source::Handshake, &name, &records)?;
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(stage: &Stage) -> Result<Self, WorkerError> {
        let last_applied = match stage.store.handshake_cursor().or_panic()? {
            Some(cursor) => Some(
                cursor
                    .parse()
                    .map_err(|_| Error::message("invalid handshake cursor"))
                    .or_panic()?,
            ),
            None => None,
        };

        Ok(Self { last_applied })
    }

    async fn schedule(&mut self, stage: &mut Stage) -> Result<WorkSchedule<WorkUnit>, WorkerError> {
        let msg = stage.upstream.recv().await.or_panic()?;
        Ok(WorkSchedule::Unit(msg.into()))
    }

    async fn execute(&mut self, unit: &WorkUnit, stage: &mut Stage) -> Result<(), WorkerError> {
        let WorkUnit::Block(block) = unit;

        if let Some(last) = &self.last_applied {
            if block.header.prev_block != *last {
                warn!(
                    prev = %block.header.prev_block,
                    last = %last,
                    "block does not extend last applied"
                );
                return Err(WorkerError::Restart);
            }
        }

        pow::validate(&block.header).or_restart()?;

        self.apply_covenants(block, stage).or_restart()?;

        let hash = block.hash();
        stage.store.set_handshake_cursor(&hash.to_string()).or_panic()?;
        self.last_applied = Some(hash);

        stage.block_count.inc(1);

        Ok(())
    }
}

#[derive(Stage)]
#[stage(name = "apply", unit = "WorkUnit", worker = "Worker")]
pub struct Stage {
    store: Store,

    pub upstream: UpstreamPort,

    #[metric]
    block_count: gasket::metrics::Counter,
}

impl Stage {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            upstream: Default::default(),
            block_count: Default::default(),
        }
    }
}
