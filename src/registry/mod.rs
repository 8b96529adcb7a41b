//! Peer Registry Module
//!
//! The registry is the single source of truth for membership. It is keyed by
//! peer address and only changes through the narrow operation set of
//! [`PeerStore`]. The shipped engine is [`PeerRegistry`] (RocksDB).

pub mod merge;
mod storage;

pub use storage::PeerRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;

use crate::peer::{PeerInternal, PeerPublic, RequestRecord, ToPublic};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] rocksdb::Error),

    #[error("peer record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Whether an upsert created or merged a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Single-field updates applied in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMutation {
    Registered,
    Activated,
    Inactive,
    AllowListed(bool),
    DenyListed(bool),
    RateLimitedUntil(Option<DateTime<Utc>>),
}

/// How many peers to hand out in a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLimit {
    /// Share nothing
    Disabled,

    /// Share every eligible peer
    All,

    /// Random sample without replacement
    AtMost(usize),
}

impl SampleLimit {
    /// `0` disables, `-1` means all, positive values bound the sample.
    /// Anything below `-1` is rejected.
    pub fn from_i64(limit: i64) -> Option<Self> {
        match limit {
            0 => Some(SampleLimit::Disabled),
            -1 => Some(SampleLimit::All),
            n if n > 0 => Some(SampleLimit::AtMost(n as usize)),
            _ => None,
        }
    }
}

/// Registry statistics for the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    /// Total peers in registry
    pub total: usize,

    /// Peers not marked inactive
    pub active: usize,

    /// Peers presumed dead
    pub inactive: usize,

    pub allow_listed: usize,
    pub deny_listed: usize,
}

impl RegistryStats {
    pub fn from_peers<'a>(peers: impl IntoIterator<Item = &'a PeerInternal>) -> Self {
        peers.into_iter().fold(Self::default(), |mut stats, peer| {
            stats.total += 1;
            if peer.inactive {
                stats.inactive += 1;
            } else {
                stats.active += 1;
            }
            if peer.allow_listed {
                stats.allow_listed += 1;
            }
            if peer.deny_listed {
                stats.deny_listed += 1;
            }
            stats
        })
    }
}

/// Persistence contract for peer records.
///
/// Every operation is atomic per record. Callers never read-modify-write a
/// record themselves; they use the targeted mutations below.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Insert a new record as given, or merge into the existing one. A merge
    /// moves `last_seen` to at least now; an insert keeps the caller's value.
    async fn upsert(&self, peer: PeerInternal) -> Result<UpsertOutcome, StoreError>;

    async fn find_all(&self) -> Result<Vec<PeerInternal>, StoreError>;

    async fn find_by_address(&self, address: &str) -> Result<Option<PeerInternal>, StoreError>;

    async fn remove(&self, address: &str) -> Result<bool, StoreError>;

    /// Returns false if the peer is unknown
    async fn append_history(&self, address: &str, entry: RequestRecord) -> Result<bool, StoreError>;

    /// Mark a successful contact: `last_seen` moves to now and the inactive
    /// marker is cleared. Returns false if the peer is unknown.
    async fn touch_last_seen(&self, address: &str) -> Result<bool, StoreError>;

    /// Returns false if the peer is unknown
    async fn apply(&self, address: &str, mutation: PeerMutation) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.find_all().await?.len())
    }

    async fn stats(&self) -> Result<RegistryStats, StoreError> {
        let peers = self.find_all().await?;
        Ok(RegistryStats::from_peers(&peers))
    }

    /// Peers to hand out to others. Deny-listed, inactive and undialable
    /// peers are never included, nor is anything in `exclude`.
    async fn sample(
        &self,
        exclude: &HashSet<String>,
        allow_listed_only: bool,
        limit: SampleLimit,
    ) -> Result<Vec<PeerPublic>, StoreError> {
        let peers = self.find_all().await?;
        Ok(select_sample(
            &peers,
            exclude,
            allow_listed_only,
            limit,
            &mut rand::thread_rng(),
        ))
    }

    async fn flush(&self) -> Result<(), StoreError>;
}

/// Pick the peers to share from a registry snapshot
pub fn select_sample<R: Rng + ?Sized>(
    peers: &[PeerInternal],
    exclude: &HashSet<String>,
    allow_listed_only: bool,
    limit: SampleLimit,
    rng: &mut R,
) -> Vec<PeerPublic> {
    let eligible: Vec<&PeerInternal> = peers
        .iter()
        .filter(|p| p.is_shareable())
        .filter(|p| !exclude.contains(p.address()))
        .filter(|p| !allow_listed_only || p.allow_listed)
        .collect();

    match limit {
        SampleLimit::Disabled => Vec::new(),
        SampleLimit::All => {
            let mut all: Vec<PeerPublic> = eligible.into_iter().map(ToPublic::to_public).collect();
            all.sort();
            all
        }
        SampleLimit::AtMost(n) => eligible
            .choose_multiple(rng, n)
            .map(|p| p.to_public())
            .collect(),
    }
}

/// Make the stored allow/deny flags match the operator's lists exactly.
///
/// Listed addresses we have never seen get a minimal record. Flags on
/// addresses no longer listed are cleared. Other fields are left alone.
pub async fn sync_operator_lists(
    store: &dyn PeerStore,
    allow: &[PeerPublic],
    deny: &[PeerPublic],
) -> Result<(), StoreError> {
    for peer in allow.iter().chain(deny) {
        if store.find_by_address(peer.address()).await?.is_none() {
            store.upsert(peer.to_internal()).await?;
        }
    }

    let allowed: HashSet<&str> = allow.iter().map(|p| p.address()).collect();
    let denied: HashSet<&str> = deny.iter().map(|p| p.address()).collect();

    for record in store.find_all().await? {
        let address = record.address();

        let listed = allowed.contains(address);
        if record.allow_listed != listed {
            store.apply(address, PeerMutation::AllowListed(listed)).await?;
        }

        let listed = denied.contains(address);
        if record.deny_listed != listed {
            store.apply(address, PeerMutation::DenyListed(listed)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatingMode;
    use crate::peer::RawPeer;

    fn peers(n: u8) -> Vec<PeerInternal> {
        (1..=n)
            .map(|i| {
                let raw = RawPeer {
                    address: format!("10.0.0.{}", i),
                    port: Some(8000),
                    display_name: None,
                };
                PeerPublic::validate(raw, OperatingMode::Development)
                    .unwrap()
                    .to_internal()
            })
            .collect()
    }

    fn excluding(address: &str) -> HashSet<String> {
        [address.to_string()].into_iter().collect()
    }

    #[test]
    fn test_sample_limit_parsing() {
        assert_eq!(SampleLimit::from_i64(0), Some(SampleLimit::Disabled));
        assert_eq!(SampleLimit::from_i64(-1), Some(SampleLimit::All));
        assert_eq!(SampleLimit::from_i64(3), Some(SampleLimit::AtMost(3)));
        assert_eq!(SampleLimit::from_i64(-2), None);
    }

    #[test]
    fn test_sample_bounds() {
        let registry = peers(10);
        let me = excluding("10.0.0.1");
        let mut rng = rand::thread_rng();

        let three = select_sample(&registry, &me, false, SampleLimit::AtMost(3), &mut rng);
        assert_eq!(three.len(), 3);
        let distinct: HashSet<&str> = three.iter().map(|p| p.address()).collect();
        assert_eq!(distinct.len(), 3);
        assert!(!distinct.contains("10.0.0.1"));

        let all = select_sample(&registry, &me, false, SampleLimit::All, &mut rng);
        assert_eq!(all.len(), 9);

        let none = select_sample(&registry, &me, false, SampleLimit::Disabled, &mut rng);
        assert!(none.is_empty());

        // Asking for more than exist returns what exists
        let many = select_sample(&registry, &me, false, SampleLimit::AtMost(50), &mut rng);
        assert_eq!(many.len(), 9);
    }

    #[test]
    fn test_sample_eligibility() {
        let mut registry = peers(4);
        registry[0].inactive = true;
        registry[1].deny_listed = true;
        registry[2].allow_listed = true;

        let minimal = PeerPublic::validate(
            RawPeer {
                address: "10.0.0.9".to_string(),
                ..Default::default()
            },
            OperatingMode::Development,
        )
        .unwrap();
        registry.push(minimal.to_internal());

        let mut rng = rand::thread_rng();
        let all = select_sample(&registry, &HashSet::new(), false, SampleLimit::All, &mut rng);
        let addresses: Vec<&str> = all.iter().map(|p| p.address()).collect();
        assert_eq!(addresses, vec!["10.0.0.3", "10.0.0.4"]);

        let allowed = select_sample(&registry, &HashSet::new(), true, SampleLimit::All, &mut rng);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].address(), "10.0.0.3");
    }

    #[test]
    fn test_stats_from_peers() {
        let mut registry = peers(3);
        registry[0].inactive = true;
        registry[1].allow_listed = true;
        registry[2].deny_listed = true;

        let stats = RegistryStats::from_peers(&registry);
        assert_eq!(
            stats,
            RegistryStats {
                total: 3,
                active: 2,
                inactive: 1,
                allow_listed: 1,
                deny_listed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_operator_lists_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::testing::open_registry(&dir);
        let known = crate::testing::dev_peer("10.0.0.2", 8000);
        let mut stale = known.to_internal();
        stale.last_seen = Utc::now() - chrono::Duration::minutes(20);
        store.upsert(stale.clone()).await.unwrap();

        let minimal = |address: &str| {
            PeerPublic::validate(
                RawPeer {
                    address: address.to_string(),
                    ..RawPeer::default()
                },
                OperatingMode::Development,
            )
            .unwrap()
        };

        sync_operator_lists(store.as_ref(), &[minimal("10.0.0.2")], &[minimal("10.0.0.9")])
            .await
            .unwrap();

        // Existing record flagged in place
        let allowed = store.find_by_address("10.0.0.2").await.unwrap().unwrap();
        assert!(allowed.allow_listed);
        assert_eq!(allowed.public().port(), Some(8000));
        assert_eq!(allowed.last_seen, stale.last_seen);

        let denied = store.find_by_address("10.0.0.9").await.unwrap().unwrap();
        assert!(denied.deny_listed);
        assert!(denied.public().is_minimal());

        // Dropped from the config: flags cleared, records kept
        sync_operator_lists(store.as_ref(), &[], &[]).await.unwrap();
        assert!(!store.find_by_address("10.0.0.2").await.unwrap().unwrap().allow_listed);
        assert!(!store.find_by_address("10.0.0.9").await.unwrap().unwrap().deny_listed);
        assert_eq!(store.count().await.unwrap(), 2);
    }
}
