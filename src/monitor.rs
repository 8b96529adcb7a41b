//! Membership Monitor
//!
//! Periodically classifies every known peer by how long ago it was last
//! seen. Stale peers are probed and, if alive, re-registered with. Presumed
//! dead peers are probed once more and marked inactive when silent. Nothing
//! is ever deleted.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::Metrics;
use crate::gossip::{transport, Gossip, PeerTransport};
use crate::peer::{PeerInternal, PeerPublic, RequestRecord};
use crate::protocol::HEALTH_CHECK_PATH;
use crate::registry::{PeerMutation, PeerStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Seen within `stale_after`
    Fresh,

    /// Silent for `stale_after` up to `dead_after`
    Stale,

    /// Silent for longer than `dead_after`
    PresumedDead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessThresholds {
    pub stale_after: Duration,
    pub dead_after: Duration,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(5),
            dead_after: Duration::minutes(10),
        }
    }
}

pub fn classify(last_seen: DateTime<Utc>, now: DateTime<Utc>, thresholds: StalenessThresholds) -> Liveness {
    let silent_for = now - last_seen;
    if silent_for > thresholds.dead_after {
        Liveness::PresumedDead
    } else if silent_for >= thresholds.stale_after {
        Liveness::Stale
    } else {
        Liveness::Fresh
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("a membership scan is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub fresh: usize,
    pub stale: usize,
    pub presumed_dead: usize,

    /// Stale peers that answered and accepted a fresh handshake
    pub reregistered: usize,

    /// Presumed-dead peers that answered their last probe
    pub revived: usize,

    /// Peers newly marked inactive in this scan
    pub marked_inactive: usize,

    /// Scan found nobody alive and went back to the bootstrap peers
    pub bootstrap_retried: bool,
}

/// Clears the running flag when a scan ends, however it ends
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MembershipMonitor {
    store: Arc<dyn PeerStore>,
    transport: Arc<dyn PeerTransport>,
    gossip: Arc<Gossip>,
    bootstrap: Vec<PeerPublic>,
    thresholds: StalenessThresholds,
    probe_timeout: std::time::Duration,
    metrics: Arc<Metrics>,

    /// Whether a scan is in progress
    running: AtomicBool,
}

impl MembershipMonitor {
    pub fn new(
        store: Arc<dyn PeerStore>,
        transport: Arc<dyn PeerTransport>,
        gossip: Arc<Gossip>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            transport,
            gossip,
            bootstrap: Vec::new(),
            thresholds: StalenessThresholds::default(),
            probe_timeout: std::time::Duration::from_secs(10),
            metrics,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Vec<PeerPublic>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_thresholds(mut self, thresholds: StalenessThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Scan forever, first scan one interval after start
    pub async fn run(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("🔭 Membership monitor started (interval: {}s)", interval.as_secs());

        loop {
            ticker.tick().await;

            match self.run_once().await {
                Ok(report) => debug!("Membership scan: {:?}", report),
                Err(MonitorError::AlreadyRunning) => debug!("Previous membership scan still running"),
                Err(e) => error!("Membership scan failed: {}", e),
            }
        }
    }

    /// One scan. Concurrent calls do not overlap: the second is refused.
    pub async fn run_once(&self) -> Result<MonitorReport, MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyRunning);
        }
        let _guard = ScanGuard(&self.running);

        self.scan().await
    }

    async fn scan(&self) -> Result<MonitorReport, MonitorError> {
        let me = self.gossip.me().address().to_string();
        let mut report = MonitorReport::default();

        // Our own record never goes stale
        self.store.touch_last_seen(&me).await?;

        let now = Utc::now();
        for peer in self.store.find_all().await? {
            if peer.address() == me || peer.deny_listed {
                continue;
            }

            match classify(peer.last_seen, now, self.thresholds) {
                Liveness::Fresh => report.fresh += 1,
                Liveness::Stale => {
                    report.stale += 1;
                    if self.probe(&peer).await? {
                        let outcome = self.gossip.register(vec![peer.public().clone()]).await;
                        if outcome.succeeded > 0 {
                            report.reregistered += 1;
                        }
                    }
                }
                Liveness::PresumedDead => {
                    report.presumed_dead += 1;

                    // Retired peers come back by contacting us or through
                    // bootstrap, never by being polled
                    if peer.inactive {
                        continue;
                    }

                    if self.probe(&peer).await? {
                        info!("💚 Peer {} is back", peer.public());
                        report.revived += 1;
                    } else {
                        self.store.apply(peer.address(), PeerMutation::Inactive).await?;
                        self.metrics.inc_peers_marked_inactive();
                        report.marked_inactive += 1;
                        info!("💀 Peer {} presumed dead, marked inactive", peer.public());
                    }
                }
            }
        }

        if !self.has_live_peers(&me).await? && !self.bootstrap.is_empty() {
            warn!("No live peers left, re-registering with {} bootstrap peers", self.bootstrap.len());
            self.gossip.register(self.bootstrap.clone()).await;
            report.bootstrap_retried = true;
        }

        let stats = self.store.stats().await?;
        self.metrics
            .set_peer_counts(stats.total as u64, stats.active as u64);

        Ok(report)
    }

    /// Health-check a peer; on success its `last_seen` is refreshed
    async fn probe(&self, peer: &PeerInternal) -> Result<bool, StoreError> {
        let target = peer.public();
        if !target.is_dialable() {
            return Ok(false);
        }

        let call = self.transport.health_check(target);
        match transport::bounded(self.probe_timeout, target, call).await {
            Ok(response) if response.is_ok() => {
                self.metrics.inc_probes_succeeded();
                self.store.touch_last_seen(target.address()).await?;
                self.store
                    .append_history(target.address(), RequestRecord::outbound("GET", HEALTH_CHECK_PATH, 200))
                    .await?;
                Ok(true)
            }
            Ok(response) => {
                self.metrics.inc_probes_failed();
                debug!("Peer {} reports status {:?}", target, response.status);
                Ok(false)
            }
            Err(e) => {
                self.metrics.inc_probes_failed();
                debug!("Probe of {} failed: {}", target, e);
                if let Some(code) = e.status() {
                    self.store
                        .append_history(target.address(), RequestRecord::outbound("GET", HEALTH_CHECK_PATH, code))
                        .await?;
                }
                Ok(false)
            }
        }
    }

    async fn has_live_peers(&self, me: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .find_all()
            .await?
            .iter()
            .any(|p| p.address() != me && !p.inactive && !p.deny_listed))
    }
}
