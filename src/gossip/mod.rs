//! Gossip Registration Protocol
//!
//! A node announces itself by registering with peers it knows. Each
//! successful handshake returns the target's peer list; peers not yet in the
//! local registry are recorded and contacted in turn, breadth first.
//!
//! ## Termination
//!
//! Before every dequeue the depth governor compares the registry size with
//! `max_depth`. Once the registry holds `max_depth` peers the call stops
//! without contacting anyone else. Since only previously unknown peers are
//! ever enqueued and each becomes known before it is enqueued, the queue is
//! finite regardless of the governor.

pub mod transport;

pub use transport::{HttpTransport, PeerTransport, TransportError};

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::Metrics;
use crate::config::OperatingMode;
use crate::peer::{PeerPublic, RawPeer, RequestRecord};
use crate::protocol::{RemoteRegisterResponse, REGISTER_PATH};
use crate::registry::{PeerStore, StoreError};

/// Default registry size at which propagation stops
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Default deadline for one handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registration stopped because the registry is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLimitReached {
    /// Registry size as seen by the governor, capped at `max_depth`
    pub depth: usize,
    pub max_depth: usize,
}

/// Outcome of one `register` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Handshakes attempted
    pub contacted: usize,

    /// Handshakes answered (including "already registered")
    pub succeeded: usize,

    /// Handshakes that failed or timed out
    pub failed: usize,

    /// Previously unknown peers learned from responses
    pub discovered: usize,

    pub depth_limit: Option<DepthLimitReached>,
}

enum Handshake {
    Registered(RemoteRegisterResponse),
    AlreadyRegistered,
}

/// Peers in `returned` whose address is not in `known`, first occurrence only
pub fn filter_new(
    returned: impl IntoIterator<Item = PeerPublic>,
    known: &HashSet<String>,
) -> Vec<PeerPublic> {
    let mut seen = HashSet::new();
    returned
        .into_iter()
        .filter(|p| !known.contains(p.address()) && seen.insert(p.address().to_string()))
        .collect()
}

/// Outbound side of the protocol
pub struct Gossip {
    store: Arc<dyn PeerStore>,
    transport: Arc<dyn PeerTransport>,
    me: PeerPublic,
    mode: OperatingMode,
    max_depth: usize,
    handshake_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Gossip {
    pub fn new(
        me: PeerPublic,
        mode: OperatingMode,
        store: Arc<dyn PeerStore>,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            transport,
            me,
            mode,
            max_depth: DEFAULT_MAX_DEPTH,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            metrics,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn me(&self) -> &PeerPublic {
        &self.me
    }

    /// `(depth, limit_reached)` for the current registry size
    pub async fn governor(&self) -> Result<(usize, bool), StoreError> {
        let size = self.store.count().await?;
        Ok((size.min(self.max_depth), size >= self.max_depth))
    }

    /// Register with `targets` and chase every peer they reveal.
    ///
    /// Never fails: per-target problems are logged and counted in the
    /// report.
    pub async fn register(&self, targets: Vec<PeerPublic>) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        let mut queue: VecDeque<PeerPublic> = targets.into();
        let mut attempted: HashSet<String> = HashSet::new();

        while let Some(target) = queue.pop_front() {
            match self.governor().await {
                Ok((depth, true)) => {
                    info!(
                        "🛑 Registry holds {} peers (max depth {}), not propagating further",
                        depth, self.max_depth
                    );
                    report.depth_limit = Some(DepthLimitReached {
                        depth,
                        max_depth: self.max_depth,
                    });
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Registry unavailable, aborting registration: {}", e);
                    break;
                }
            }

            if !attempted.insert(target.address().to_string()) {
                continue;
            }
            if !self.should_contact(&target).await {
                continue;
            }

            report.contacted += 1;

            match self.handshake(&target).await {
                Ok(Handshake::Registered(response)) => {
                    report.succeeded += 1;
                    self.metrics.inc_handshakes_succeeded();

                    let RemoteRegisterResponse { peer, peer_list } = response;
                    if let Err(e) = self.record_target(&target, Some(peer), 200).await {
                        error!("Failed to record handshake with {}: {}", target, e);
                    }

                    match self.absorb_peer_list(&target, peer_list).await {
                        Ok(new) => {
                            info!("🤝 Registered with {} ({} new peers)", target, new.len());
                            report.discovered += new.len();
                            queue.extend(new);
                        }
                        Err(e) => error!("Failed to store peers from {}: {}", target, e),
                    }
                }
                Ok(Handshake::AlreadyRegistered) => {
                    report.succeeded += 1;
                    self.metrics.inc_handshakes_succeeded();
                    debug!("Already registered with {}", target);

                    if let Err(e) = self.record_target(&target, None, 400).await {
                        error!("Failed to record handshake with {}: {}", target, e);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.inc_handshakes_failed();
                    warn!("Failed to register with {}: {}", target, e);

                    if let Some(code) = e.status() {
                        let entry = RequestRecord::outbound("POST", REGISTER_PATH, code);
                        if let Err(e) = self.store.append_history(target.address(), entry).await {
                            error!("Failed to record handshake with {}: {}", target, e);
                        }
                    }
                }
            }
        }

        debug!(
            "Registration pass: {}/{} handshakes succeeded, {} peers discovered",
            report.succeeded, report.contacted, report.discovered
        );

        report
    }

    async fn should_contact(&self, target: &PeerPublic) -> bool {
        if target.address() == self.me.address() {
            debug!("Skipping self as registration target");
            return false;
        }

        if !target.is_dialable() {
            debug!("Skipping {}: no port advertised", target);
            return false;
        }

        match self.store.find_by_address(target.address()).await {
            Ok(Some(known)) if known.deny_listed => {
                debug!("Skipping deny-listed peer {}", target);
                false
            }
            Ok(_) => true,
            Err(e) => {
                error!("Registry lookup failed for {}: {}", target, e);
                false
            }
        }
    }

    async fn handshake(&self, target: &PeerPublic) -> Result<Handshake, TransportError> {
        let call = self.transport.register(target, &self.me);

        match transport::bounded(self.handshake_timeout, target, call).await {
            Ok(response) => Ok(Handshake::Registered(response)),
            Err(TransportError::AlreadyRegistered) => Ok(Handshake::AlreadyRegistered),
            Err(e) => Err(e),
        }
    }

    /// Record the target as contacted and registered-with. Its own reported
    /// record is merged in when it matches the address we dialled.
    async fn record_target(
        &self,
        target: &PeerPublic,
        reported: Option<RawPeer>,
        code: u16,
    ) -> Result<(), StoreError> {
        let confirmed = reported
            .and_then(|raw| PeerPublic::validate(raw, self.mode).ok())
            .filter(|p| p.address() == target.address());

        let mut record = confirmed.as_ref().unwrap_or(target).to_internal();
        record.registered = true;
        record
            .request_history
            .push(RequestRecord::outbound("POST", REGISTER_PATH, code));

        self.store.upsert(record).await?;
        Ok(())
    }

    /// Validate a returned peer list and store the peers we did not know.
    /// Returns the newly stored peers.
    async fn absorb_peer_list(
        &self,
        source: &PeerPublic,
        peer_list: Vec<RawPeer>,
    ) -> Result<Vec<PeerPublic>, StoreError> {
        let returned: Vec<PeerPublic> = peer_list
            .into_iter()
            .filter_map(|raw| match PeerPublic::validate(raw, self.mode) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    debug!("Dropping invalid peer from {}: {}", source, e);
                    None
                }
            })
            .collect();

        // Recomputed per target: earlier handshakes may have added peers
        let mut known: HashSet<String> = self
            .store
            .find_all()
            .await?
            .iter()
            .map(|p| p.address().to_string())
            .collect();
        known.insert(self.me.address().to_string());

        let mut added = Vec::new();
        for peer in filter_new(returned, &known) {
            match self.store.upsert(peer.to_internal()).await {
                Ok(_) => added.push(peer),
                Err(e) => error!("Failed to store peer {}: {}", peer, e),
            }
        }

        Ok(added)
    }
}
