//! Test fixtures: peers, on-disk registries and an in-process network
//! where every node answers through its own `RegistrationService`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::api::{ApiError, Metrics, RegistrationService};
use crate::config::OperatingMode;
use crate::gossip::{PeerTransport, TransportError};
use crate::peer::{PeerPublic, RawPeer};
use crate::protocol::{HealthResponse, RegisterResponse, RemoteHealthResponse, RemoteRegisterResponse};
use crate::registry::{PeerRegistry, PeerStore};

pub fn raw_peer(address: &str, port: Option<i64>, name: Option<&str>) -> RawPeer {
    RawPeer {
        address: address.to_string(),
        port,
        display_name: name.map(str::to_string),
    }
}

pub fn dev_peer(address: &str, port: u16) -> PeerPublic {
    PeerPublic::validate(
        raw_peer(address, Some(i64::from(port)), None),
        OperatingMode::Development,
    )
    .unwrap()
}

pub fn open_registry(dir: &TempDir) -> Arc<dyn PeerStore> {
    Arc::new(PeerRegistry::open(dir.path(), 100).unwrap())
}

/// A node living inside a [`Loopback`] network
pub struct TestNode {
    pub me: PeerPublic,
    pub store: Arc<dyn PeerStore>,
    pub service: Arc<RegistrationService>,
    _dir: TempDir,
}

impl TestNode {
    /// Fresh node with its own registry, already containing itself
    pub async fn start(address: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = open_registry(&dir);
        let me = dev_peer(address, 8000);
        store.upsert(me.to_internal()).await.unwrap();

        let service = Arc::new(RegistrationService::new(
            me.clone(),
            OperatingMode::Development,
            store.clone(),
            Arc::new(Metrics::new()),
        ));

        Self {
            me,
            store,
            service,
            _dir: dir,
        }
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.store
            .find_all()
            .await
            .unwrap()
            .iter()
            .map(|p| p.address().to_string())
            .collect()
    }
}

/// In-memory transport routing requests to registered [`TestNode`]s.
///
/// Unknown addresses refuse the connection, hanging addresses never answer.
#[derive(Default)]
pub struct Loopback {
    nodes: Mutex<HashMap<String, Arc<RegistrationService>>>,
    hanging: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, node: &TestNode) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.me.address().to_string(), node.service.clone());
    }

    pub fn hang(&self, address: &str) {
        self.hanging.lock().unwrap().insert(address.to_string());
    }

    /// Every answered call is delayed by `delay`
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Outbound calls attempted so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn route(&self, target: &PeerPublic) -> Result<Arc<RegistrationService>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.hanging.lock().unwrap().contains(target.address()) {
            std::future::pending::<()>().await;
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let node = self.nodes.lock().unwrap().get(target.address()).cloned();
        node.ok_or_else(|| TransportError::Request(format!("connection refused by {}", target)))
    }
}

fn rejected(e: ApiError) -> TransportError {
    match e {
        ApiError::AlreadyRegistered => TransportError::AlreadyRegistered,
        other => TransportError::Rejected {
            status: other.status().as_u16(),
            detail: other.to_string(),
        },
    }
}

fn to_remote(peer: &PeerPublic) -> RawPeer {
    RawPeer::from(peer)
}

#[async_trait]
impl PeerTransport for Loopback {
    async fn register(
        &self,
        target: &PeerPublic,
        me: &PeerPublic,
    ) -> Result<RemoteRegisterResponse, TransportError> {
        let node = self.route(target).await?;
        let caller: Option<IpAddr> = me.address().parse().ok();

        let RegisterResponse { peer, peer_list } = node
            .handle_register(to_remote(me), caller)
            .await
            .map_err(rejected)?;

        Ok(RegisterResponse {
            peer: to_remote(&peer),
            peer_list: peer_list.iter().map(to_remote).collect(),
        })
    }

    async fn health_check(&self, target: &PeerPublic) -> Result<RemoteHealthResponse, TransportError> {
        let node = self.route(target).await?;
        let HealthResponse { status, peer } = node.health().await.map_err(rejected)?;
        Ok(HealthResponse {
            status,
            peer: to_remote(&peer),
        })
    }
}
