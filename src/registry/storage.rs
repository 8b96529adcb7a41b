//! Peer Registry Storage (RocksDB)
//!
//! Persistent storage for peer records, keyed by address.
//! Survives node restarts so membership knowledge is not lost.

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{IteratorMode, Options, DB};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::merge;
use super::{PeerMutation, PeerStore, StoreError, UpsertOutcome};
use crate::peer::{PeerInternal, RequestRecord};

/// Key prefix for peer documents
const PREFIX_PEER: &[u8] = b"peer:";

/// Peer registry backed by RocksDB
pub struct PeerRegistry {
    /// RocksDB instance
    db: DB,

    /// In-memory copy of every document, keyed by address. Writers hold the
    /// lock across the disk write so each document changes atomically.
    cache: RwLock<HashMap<String, PeerInternal>>,

    /// Maximum request history entries per peer
    history_limit: usize,
}

impl PeerRegistry {
    /// Open or create a peer registry at the given path
    pub fn open(path: &Path, history_limit: usize) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(100);
        opts.set_keep_log_file_num(3);

        let db = DB::open(&opts, path)?;

        // Load existing peers into cache
        let mut cache = HashMap::new();
        let iter = db.iterator(IteratorMode::From(PREFIX_PEER, rocksdb::Direction::Forward));

        for item in iter {
            let (key, value) = item?;

            if !key.starts_with(PREFIX_PEER) {
                break;
            }

            match bincode::deserialize::<PeerInternal>(&value) {
                Ok(peer) => {
                    cache.insert(peer.address().to_string(), peer);
                }
                Err(e) => warn!("Skipping undecodable peer record {:?}: {}", String::from_utf8_lossy(&key), e),
            }
        }

        info!("📦 Loaded {} peers from registry", cache.len());

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            history_limit,
        })
    }

    fn persist(&self, peer: &PeerInternal) -> Result<(), StoreError> {
        let value = bincode::serialize(peer)?;
        self.db.put(peer_key(peer.address()), value)?;
        Ok(())
    }

    /// Apply `f` to one record, write it through, then publish it to the cache
    async fn mutate<F>(&self, address: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut PeerInternal) + Send,
    {
        let mut cache = self.cache.write().await;

        let Some(existing) = cache.get(address) else {
            debug!("Ignoring update for unknown peer {}", address);
            return Ok(false);
        };

        let mut updated = existing.clone();
        f(&mut updated);
        self.persist(&updated)?;
        cache.insert(address.to_string(), updated);
        Ok(true)
    }
}

#[async_trait]
impl PeerStore for PeerRegistry {
    async fn upsert(&self, peer: PeerInternal) -> Result<UpsertOutcome, StoreError> {
        let mut cache = self.cache.write().await;

        let (record, outcome) = match cache.get(peer.address()) {
            Some(existing) => {
                let mut merged = existing.clone();
                merge::merge_into(&mut merged, peer, Utc::now(), self.history_limit);
                (merged, UpsertOutcome::Updated)
            }
            None => {
                let mut fresh = peer;
                merge::truncate_history(&mut fresh.request_history, self.history_limit);
                (fresh, UpsertOutcome::Inserted)
            }
        };

        self.persist(&record)?;
        cache.insert(record.address().to_string(), record);
        Ok(outcome)
    }

    async fn find_all(&self) -> Result<Vec<PeerInternal>, StoreError> {
        let cache = self.cache.read().await;
        let mut peers: Vec<PeerInternal> = cache.values().cloned().collect();
        peers.sort_by(|a, b| a.address().cmp(b.address()));
        Ok(peers)
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<PeerInternal>, StoreError> {
        Ok(self.cache.read().await.get(address).cloned())
    }

    async fn remove(&self, address: &str) -> Result<bool, StoreError> {
        let mut cache = self.cache.write().await;
        if !cache.contains_key(address) {
            return Ok(false);
        }
        self.db.delete(peer_key(address))?;
        cache.remove(address);
        Ok(true)
    }

    async fn append_history(&self, address: &str, entry: RequestRecord) -> Result<bool, StoreError> {
        let limit = self.history_limit;
        self.mutate(address, move |peer| {
            merge::append_bounded(&mut peer.request_history, entry, limit)
        })
        .await
    }

    async fn touch_last_seen(&self, address: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        self.mutate(address, move |peer| {
            peer.last_seen = peer.last_seen.max(now);
            peer.inactive = false;
        })
        .await
    }

    async fn apply(&self, address: &str, mutation: PeerMutation) -> Result<bool, StoreError> {
        self.mutate(address, move |peer| match mutation {
            PeerMutation::Registered => peer.registered = true,
            PeerMutation::Activated => peer.activated = true,
            PeerMutation::Inactive => peer.inactive = true,
            PeerMutation::AllowListed(on) => peer.allow_listed = on,
            PeerMutation::DenyListed(on) => peer.deny_listed = on,
            PeerMutation::RateLimitedUntil(until) => peer.rate_limited_until = until,
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.cache.read().await.len())
    }

    /// Flush all changes to disk
    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Create storage key for a peer
fn peer_key(address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(PREFIX_PEER.len() + address.len());
    key.extend_from_slice(PREFIX_PEER);
    key.extend_from_slice(address.as_bytes());
    key
}
