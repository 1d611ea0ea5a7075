//! Materialized DNS zone store.
//!
//! One flat redb keyspace holds the zones observed on both chains, the sync
//! cursors and a handful of bookkeeping entries. Zone updates are
//! transactional: new record keys, deletion of orphaned keys and the
//! rewrite of the per-domain tracking key all land in a single commit.
//!
//! Key schema:
//!
//! - `r_{TYPE}_{owner}_{index}` / `hs_r_{TYPE}_{owner}_{index}`: one DNS
//!   record (Cardano / Handshake prefix), JSON value
//! - `d_{domain}_records` / `hs_d_{domain}_records`: CSV of the record
//!   keys currently live for the domain
//! - `hs_name_hash_{hex}`: raw Handshake name by name-hash
//! - `chainsync_cursor`, `handshake_cursor`: per-chain sync cursors
//! - `discovered_addresses`: JSON list of discovered script addresses
//! - `config_fingerprint`: network guard written on first open

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

const KEY_CHAINSYNC_CURSOR: &[u8] = b"chainsync_cursor";
const KEY_HANDSHAKE_CURSOR: &[u8] = b"handshake_cursor";
const KEY_DISCOVERED_ADDRESSES: &[u8] = b"discovered_addresses";
const KEY_CONFIG_FINGERPRINT: &[u8] = b"config_fingerprint";

/// Interval between background compaction passes.
pub const GC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    DatabaseError(#[from] redb::DatabaseError),

    #[error(transparent)]
    TransactionError(Box<redb::TransactionError>),

    #[error(transparent)]
    CommitError(#[from] redb::CommitError),

    #[error(transparent)]
    TableError(#[from] redb::TableError),

    #[error(transparent)]
    StorageError(#[from] redb::StorageError),

    #[error(transparent)]
    CompactionError(Box<redb::CompactionError>),

    #[error("value under {key} is not valid json: {source}")]
    ValueEncoding {
        key: String,
        source: serde_json::Error,
    },

    #[error("store fingerprint mismatch: stored {stored:?}, configured {configured:?}")]
    FingerprintMismatch { stored: String, configured: String },
}

impl From<redb::TransactionError> for Error {
    fn from(error: redb::TransactionError) -> Self {
        Error::TransactionError(Box::new(error))
    }
}

impl From<redb::CompactionError> for Error {
    fn from(error: redb::CompactionError) -> Self {
        Error::CompactionError(Box::new(error))
    }
}

/// Which chain a zone write belongs to. The two sources use disjoint key
/// prefixes and may interleave safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cardano,
    Handshake,
}

impl Source {
    fn prefix(&self) -> &'static str {
        match self {
            Source::Cardano => "",
            Source::Handshake => "hs_",
        }
    }
}

/// One materialized DNS record. A TTL of zero means unspecified; the
/// resolver substitutes its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub lhs: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub ttl: u32,
    pub rhs: String,
}

impl Record {
    pub fn new(lhs: impl Into<String>, rtype: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self {
            lhs: lhs.into(),
            rtype: rtype.into(),
            ttl: 0,
            rhs: rhs.into(),
        }
    }
}

/// A dynamically discovered Cardano script address being watched for zone
/// data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredAddress {
    pub address: String,
    pub tld: String,
    pub policy_id: String,
}

fn trim_owner(owner: &str) -> &str {
    owner.trim_end_matches('.')
}

fn record_key(source: Source, rtype: &str, owner: &str, index: usize) -> String {
    format!(
        "{}r_{}_{}_{}",
        source.prefix(),
        rtype,
        trim_owner(owner),
        index
    )
}

fn tracking_key(source: Source, domain: &str) -> String {
    format!("{}d_{}_records", source.prefix(), trim_owner(domain))
}

fn name_hash_key(hash: &[u8]) -> String {
    format!("hs_name_hash_{}", hex::encode(hash))
}

#[derive(Clone)]
pub struct Store {
    db: Arc<RwLock<Database>>,
}

impl Store {
    /// Open (or create) the store and run the fingerprint guard.
    ///
    /// The fingerprint written on first open is immutable; reopening with a
    /// different one is fatal and requires operator intervention.
    pub fn open(path: impl AsRef<Path>, fingerprint: &str) -> Result<Self, Error> {
        let db = Database::create(path)?;

        let store = Self {
            db: Arc::new(RwLock::new(db)),
        };

        store.guard_fingerprint(fingerprint)?;

        Ok(store)
    }

    fn guard_fingerprint(&self, configured: &str) -> Result<(), Error> {
        match self.get_string(KEY_CONFIG_FINGERPRINT)? {
            None => {
                info!(fingerprint = configured, "initializing store fingerprint");
                self.put_string(KEY_CONFIG_FINGERPRINT, configured)
            }
            Some(stored) if stored == configured => Ok(()),
            Some(stored) => Err(Error::FingerprintMismatch {
                stored,
                configured: configured.to_string(),
            }),
        }
    }

    fn get_string(&self, key: &[u8]) -> Result<Option<String>, Error> {
        let db = self.db.read().expect("poisoned lock");
        let rx = db.begin_read()?;

        let table = match rx.open_table(TABLE) {
            Ok(table) => table,
            // first read before any commit
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let value = table.get(key)?;

        Ok(value.map(|v| String::from_utf8_lossy(v.value()).into_owned()))
    }

    fn put_string(&self, key: &[u8], value: &str) -> Result<(), Error> {
        let db = self.db.read().expect("poisoned lock");
        let wx = db.begin_write()?;

        {
            let mut table = wx.open_table(TABLE)?;
            table.insert(key, value.as_bytes())?;
        }

        wx.commit()?;

        Ok(())
    }

    /// Replace the zone for `domain` with exactly `records`, atomically.
    ///
    /// Record keys no longer present are deleted in the same commit that
    /// inserts the new set and rewrites the tracking key.
    pub fn update_zone(
        &self,
        source: Source,
        domain: &str,
        records: &[Record],
    ) -> Result<(), Error> {
        let track_key = tracking_key(source, domain);

        let db = self.db.read().expect("poisoned lock");
        let wx = db.begin_write()?;

        {
            let mut table = wx.open_table(TABLE)?;

            let old_keys: Vec<String> = match table.get(track_key.as_bytes())? {
                Some(csv) => String::from_utf8_lossy(csv.value())
                    .split(',')
                    .filter(|k| !k.is_empty())
                    .map(|k| k.to_string())
                    .collect(),
                None => Vec::new(),
            };

            let mut new_keys = Vec::with_capacity(records.len());

            for record in records {
                // index per (type, owner) pair keeps sibling records apart
                let index = new_keys
                    .iter()
                    .filter(|k: &&String| {
                        k.starts_with(&format!(
                            "{}r_{}_{}_",
                            source.prefix(),
                            record.rtype,
                            trim_owner(&record.lhs)
                        ))
                    })
                    .count();

                let key = record_key(source, &record.rtype, &record.lhs, index);

                let value =
                    serde_json::to_vec(record).map_err(|source| Error::ValueEncoding {
                        key: key.clone(),
                        source,
                    })?;

                table.insert(key.as_bytes(), value.as_slice())?;
                new_keys.push(key);
            }

            for stale in old_keys.iter().filter(|k| !new_keys.contains(k)) {
                table.remove(stale.as_bytes())?;
            }

            table.insert(track_key.as_bytes(), new_keys.join(",").as_bytes())?;
        }

        wx.commit()?;

        debug!(domain, count = records.len(), "zone replaced");

        Ok(())
    }

    /// `update_zone` under its other name; both fully replace the zone.
    pub fn replace_zone(
        &self,
        source: Source,
        domain: &str,
        records: &[Record],
    ) -> Result<(), Error> {
        self.update_zone(source, domain, records)
    }

    /// All records for `owner` whose type is in `types`.
    pub fn lookup_records(
        &self,
        source: Source,
        types: &[&str],
        owner: &str,
    ) -> Result<Vec<Record>, Error> {
        let db = self.db.read().expect("poisoned lock");
        let rx = db.begin_read()?;

        let table = match rx.open_table(TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();

        for rtype in types {
            let prefix = format!(
                "{}r_{}_{}_",
                source.prefix(),
                rtype,
                trim_owner(owner)
            );

            let mut end = prefix.clone().into_bytes();
            end.push(0xff);

            for entry in table.range(prefix.as_bytes()..end.as_slice())? {
                let (key, value) = entry?;

                let record: Record =
                    serde_json::from_slice(value.value()).map_err(|source| {
                        Error::ValueEncoding {
                            key: String::from_utf8_lossy(key.value()).into_owned(),
                            source,
                        }
                    })?;

                records.push(record);
            }
        }

        Ok(records)
    }

    /// Remember a raw Handshake name under its name-hash.
    pub fn put_name(&self, name_hash: &[u8], name: &str) -> Result<(), Error> {
        self.put_string(name_hash_key(name_hash).as_bytes(), name)
    }

    /// Look a Handshake name up by its name-hash.
    pub fn lookup_name_by_hash(&self, name_hash: &[u8]) -> Result<Option<String>, Error> {
        self.get_string(name_hash_key(name_hash).as_bytes())
    }

    pub fn chainsync_cursor(&self) -> Result<Option<String>, Error> {
        self.get_string(KEY_CHAINSYNC_CURSOR)
    }

    pub fn set_chainsync_cursor(&self, cursor: &str) -> Result<(), Error> {
        self.put_string(KEY_CHAINSYNC_CURSOR, cursor)
    }

    pub fn handshake_cursor(&self) -> Result<Option<String>, Error> {
        self.get_string(KEY_HANDSHAKE_CURSOR)
    }

    pub fn set_handshake_cursor(&self, cursor: &str) -> Result<(), Error> {
        self.put_string(KEY_HANDSHAKE_CURSOR, cursor)
    }

    pub fn discovered_addresses(&self) -> Result<Vec<DiscoveredAddress>, Error> {
        match self.get_string(KEY_DISCOVERED_ADDRESSES)? {
            None => Ok(Vec::new()),
            Some(json) => {
                serde_json::from_str(&json).map_err(|source| Error::ValueEncoding {
                    key: "discovered_addresses".into(),
                    source,
                })
            }
        }
    }

    pub fn set_discovered_addresses(
        &self,
        addresses: &[DiscoveredAddress],
    ) -> Result<(), Error> {
        let json = serde_json::to_string(addresses).map_err(|source| Error::ValueEncoding {
            key: "discovered_addresses".into(),
            source,
        })?;

        self.put_string(KEY_DISCOVERED_ADDRESSES, &json)
    }

    /// The raw CSV tracking entry for a domain, for inspection tooling.
    pub fn zone_keys(&self, source: Source, domain: &str) -> Result<Vec<String>, Error> {
        match self.get_string(tracking_key(source, domain).as_bytes())? {
            None => Ok(Vec::new()),
            Some(csv) => Ok(csv
                .split(',')
                .filter(|k| !k.is_empty())
                .map(|k| k.to_string())
                .collect()),
        }
    }

    /// Run one compaction pass. Returns whether the pass made progress.
    pub fn compact(&self) -> Result<bool, Error> {
        let mut db = self.db.write().expect("poisoned lock");
        Ok(db.compact()?)
    }

    /// Background value-log housekeeping: one pass per tick, repeated while
    /// a pass reports progress.
    pub async fn run_gc(self) {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let store = self.clone();

            let result = tokio::task::spawn_blocking(move || -> Result<u32, Error> {
                let mut passes = 0;
                while store.compact()? {
                    passes += 1;
                }
                Ok(passes)
            })
            .await;

            match result {
                Ok(Ok(passes)) if passes > 0 => debug!(passes, "store compacted"),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "store compaction failed"),
                Err(err) => warn!(error = %err, "store compaction task panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("zones.redb"), "network=preview,magic=2").unwrap();
        (dir, store)
    }

    fn glue_zone() -> Vec<Record> {
        vec![
            Record::new("hydra.", "NS", "ns1.hydra."),
            Record::new("hydra.", "NS", "ns2.hydra."),
            Record::new("ns1.hydra.", "A", "10.0.0.1"),
            Record::new("ns2.hydra.", "A", "10.0.0.2"),
        ]
    }

    #[test]
    fn zone_update_is_visible() {
        let (_dir, store) = temp_store();

        store
            .update_zone(Source::Cardano, "hydra.", &glue_zone())
            .unwrap();

        let ns = store
            .lookup_records(Source::Cardano, &["NS"], "hydra.")
            .unwrap();
        assert_eq!(ns.len(), 2);

        let a = store
            .lookup_records(Source::Cardano, &["A"], "ns1.hydra.")
            .unwrap();
        assert_eq!(a, vec![Record::new("ns1.hydra.", "A", "10.0.0.1")]);
    }

    #[test]
    fn zone_replacement_is_atomic() {
        let (_dir, store) = temp_store();

        store
            .update_zone(Source::Cardano, "hydra.", &glue_zone())
            .unwrap();

        let replacement = vec![Record::new("hydra.", "NS", "ns9.hydra.")];
        store
            .update_zone(Source::Cardano, "hydra.", &replacement)
            .unwrap();

        let ns = store
            .lookup_records(Source::Cardano, &["NS"], "hydra.")
            .unwrap();
        assert_eq!(ns, replacement);

        // glue from the previous zone is gone
        let a = store
            .lookup_records(Source::Cardano, &["A"], "ns1.hydra.")
            .unwrap();
        assert!(a.is_empty());

        // the tracking key lists exactly the live record keys
        let keys = store.zone_keys(Source::Cardano, "hydra.").unwrap();
        assert_eq!(keys, vec!["r_NS_hydra_0".to_string()]);
    }

    #[test]
    fn sources_are_disjoint() {
        let (_dir, store) = temp_store();

        store
            .update_zone(Source::Handshake, "trees.", &[Record::new("trees.", "NS", "ns1.trees.")])
            .unwrap();

        let cardano = store
            .lookup_records(Source::Cardano, &["NS"], "trees.")
            .unwrap();
        assert!(cardano.is_empty());

        let handshake = store
            .lookup_records(Source::Handshake, &["NS"], "trees.")
            .unwrap();
        assert_eq!(handshake.len(), 1);
    }

    #[test]
    fn cursors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.redb");

        {
            let store = Store::open(&path, "network=preview,magic=2").unwrap();
            store.set_handshake_cursor("00aa").unwrap();
            store.set_chainsync_cursor("42,00bb").unwrap();
        }

        let store = Store::open(&path, "network=preview,magic=2").unwrap();
        assert_eq!(store.handshake_cursor().unwrap().as_deref(), Some("00aa"));
        assert_eq!(
            store.chainsync_cursor().unwrap().as_deref(),
            Some("42,00bb")
        );
    }

    #[test]
    fn fingerprint_guard_refuses_other_networks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.redb");

        {
            Store::open(&path, "network=preview,magic=2").unwrap();
        }

        let result = Store::open(&path, "network=mainnet,magic=764824073");
        assert!(matches!(
            result,
            Err(Error::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn name_hash_round_trip() {
        let (_dir, store) = temp_store();

        let hash = [0x5a; 32];
        store.put_name(&hash, "irvwilliam").unwrap();

        assert_eq!(
            store.lookup_name_by_hash(&hash).unwrap().as_deref(),
            Some("irvwilliam")
        );
        assert_eq!(store.lookup_name_by_hash(&[0u8; 32]).unwrap(), None);
    }

    #[test]
    fn discovered_addresses_round_trip() {
        let (_dir, store) = temp_store();

        assert!(store.discovered_addresses().unwrap().is_empty());

        let addresses = vec![DiscoveredAddress {
            address: "addr_test1wz...".into(),
            tld: "hydra".into(),
            policy_id: "ab".repeat(28),
        }];

        store.set_discovered_addresses(&addresses).unwrap();
        assert_eq!(store.discovered_addresses().unwrap(), addresses);
    }

    #[test]
    fn compaction_reports_progress_flag() {
        let (_dir, store) = temp_store();

        store
            .update_zone(Source::Cardano, "hydra.", &glue_zone())
            .unwrap();

        // nothing to assert on the flag itself other than that the call
        // works on a live database
        let _ = store.compact().unwrap();
    }
}
