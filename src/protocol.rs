//! PEX Wire Protocol
//!
//! Endpoint paths and JSON bodies exchanged between nodes. Bodies are
//! generic over the peer type: a node sends [`PeerPublic`] and decodes what
//! it receives as [`RawPeer`], which must pass validation before use.

use serde::{Deserialize, Serialize};

use crate::peer::{PeerPublic, RawPeer};

/// Registration endpoint
pub const REGISTER_PATH: &str = "/register";

/// Peer list endpoint
pub const PEER_LIST_PATH: &str = "/peer_list";

/// Liveness endpoint
pub const HEALTH_CHECK_PATH: &str = "/health_check";

/// `detail` of the 400 sent to a peer that registers again too soon
pub const ALREADY_REGISTERED_DETAIL: &str = "Peer already registered";

/// `detail` of the 500 sent when this node cannot serve health checks
pub const UNHEALTHY_DETAIL: &str = "Node is not healthy";

pub const STATUS_OK: &str = "OK";

/// Reply to `POST /register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse<P = PeerPublic> {
    /// The replying node's own record
    pub peer: P,

    /// A sample of the replying node's registry
    #[serde(default = "Vec::new")]
    pub peer_list: Vec<P>,
}

/// Reply to `GET /peer_list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerListResponse<P = PeerPublic> {
    #[serde(default = "Vec::new")]
    pub peer_list: Vec<P>,
}

/// Reply to `GET /health_check`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse<P = PeerPublic> {
    pub status: String,
    pub peer: P,
}

impl HealthResponse {
    pub fn ok(peer: PeerPublic) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            peer,
        }
    }
}

impl<P> HealthResponse<P> {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Body of every non-2xx reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// What a node receives from a remote `/register`
pub type RemoteRegisterResponse = RegisterResponse<RawPeer>;

/// What a node receives from a remote `/health_check`
pub type RemoteHealthResponse = HealthResponse<RawPeer>;
