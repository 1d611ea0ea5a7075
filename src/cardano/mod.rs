//! The Cardano indexer surface.
//!
//! The chain-follower transport lives outside this crate; whatever drives
//! it implements [`ZoneFeed`] and delivers the three event kinds below.
//! This module owns everything on the store side of that boundary: applying
//! zone updates, advancing the chain-sync cursor, and the bookkeeping for
//! dynamically discovered script addresses.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Profile;
use crate::prelude::Error;
use crate::store::{DiscoveredAddress, Record, Source, Store};
use crate::sync::records::canonicalize;

/// One update out of the watched Cardano chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneEvent {
    /// Replace the zone for a domain with the given records.
    ZoneUpdate {
        domain: String,
        records: Vec<Record>,
    },

    /// A script address surfaced in a watched datum and may join the
    /// watched set.
    Discovery {
        address: String,
        tld: String,
        policy_id: String,
    },

    /// The follower finished a block; persist the cursor.
    Checkpoint { slot: u64, block_hash: String },
}

/// Transport-agnostic source of indexer events, in chain order.
#[async_trait]
pub trait ZoneFeed: Send {
    /// The next event, or `None` once the stream is exhausted.
    async fn next_event(&mut self) -> Result<Option<ZoneEvent>, Error>;
}

/// Drive a feed to exhaustion, applying every event to the store.
///
/// Zone updates and the subsequent checkpoint are separate commits; a crash
/// between them replays the block on restart, which is harmless because
/// zone replacement is idempotent.
pub async fn run(
    mut feed: impl ZoneFeed,
    store: Store,
    profiles: Vec<Profile>,
) -> Result<(), Error> {
    while let Some(event) = feed.next_event().await? {
        apply_event(&store, &profiles, event)?;
    }

    info!("cardano feed ended");

    Ok(())
}

fn apply_event(store: &Store, profiles: &[Profile], event: ZoneEvent) -> Result<(), Error> {
    match event {
        ZoneEvent::ZoneUpdate { domain, records } => {
            let domain = canonicalize(&domain);

            info!(%domain, records = records.len(), "zone update from indexer");
            store.update_zone(Source::Cardano, &domain, &records)?;
        }
        ZoneEvent::Discovery {
            address,
            tld,
            policy_id,
        } => {
            apply_discovery(store, profiles, address, tld, policy_id)?;
        }
        ZoneEvent::Checkpoint { slot, block_hash } => {
            store.set_chainsync_cursor(&format!("{slot},{block_hash}"))?;
        }
    }

    Ok(())
}

/// Add a discovered address when its asset policy matches an active
/// profile; anything else is ignored with a logged reason.
fn apply_discovery(
    store: &Store,
    profiles: &[Profile],
    address: String,
    tld: String,
    policy_id: String,
) -> Result<(), Error> {
    if !profiles.iter().any(|p| p.policy_id == policy_id) {
        debug!(%address, %policy_id, "discovery rejected: unwatched policy");
        return Ok(());
    }

    let mut known = store.discovered_addresses()?;

    if known.iter().any(|entry| entry.address == address) {
        debug!(%address, "discovery rejected: already watched");
        return Ok(());
    }

    info!(%address, %tld, "watching discovered address");

    known.push(DiscoveredAddress {
        address,
        tld,
        policy_id,
    });

    store.set_discovered_addresses(&known)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_profile;
    use std::collections::VecDeque;

    struct QueueFeed(VecDeque<ZoneEvent>);

    #[async_trait]
    impl ZoneFeed for QueueFeed {
        async fn next_event(&mut self) -> Result<Option<ZoneEvent>, Error> {
            Ok(self.0.pop_front())
        }
    }

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("zones.redb"), "network=preview,network-magic=2")
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn events_apply_in_order() {
        let (_dir, store) = temp_store();
        let profile = builtin_profile("preview-hydra").unwrap();

        let feed = QueueFeed(VecDeque::from(vec![
            ZoneEvent::ZoneUpdate {
                domain: "hydra".into(),
                records: vec![Record::new("hydra.", "NS", "ns1.hydra.")],
            },
            ZoneEvent::Checkpoint {
                slot: 42,
                block_hash: "00aa".into(),
            },
        ]));

        run(feed, store.clone(), vec![profile]).await.unwrap();

        let ns = store
            .lookup_records(Source::Cardano, &["NS"], "hydra.")
            .unwrap();
        assert_eq!(ns.len(), 1);

        assert_eq!(
            store.chainsync_cursor().unwrap().as_deref(),
            Some("42,00aa")
        );
    }

    #[tokio::test]
    async fn discovery_requires_matching_policy() {
        let (_dir, store) = temp_store();
        let profile = builtin_profile("preview-hydra").unwrap();
        let policy = profile.policy_id.clone();

        let feed = QueueFeed(VecDeque::from(vec![
            ZoneEvent::Discovery {
                address: "addr_test1good".into(),
                tld: "hydra".into(),
                policy_id: policy.clone(),
            },
            ZoneEvent::Discovery {
                address: "addr_test1stranger".into(),
                tld: "hydra".into(),
                policy_id: "ff".repeat(28),
            },
            // repeat of an already-watched address
            ZoneEvent::Discovery {
                address: "addr_test1good".into(),
                tld: "hydra".into(),
                policy_id: policy,
            },
        ]));

        run(feed, store.clone(), vec![profile]).await.unwrap();

        let discovered = store.discovered_addresses().unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].address, "addr_test1good");
    }
}
