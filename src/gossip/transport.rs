//! Outbound HTTP client
//!
//! The gossip protocol and the membership monitor talk to remote peers only
//! through [`PeerTransport`], so the protocol can be exercised in-process
//! without sockets.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::peer::PeerPublic;
use crate::protocol::{
    ErrorResponse, RemoteHealthResponse, RemoteRegisterResponse, ALREADY_REGISTERED_DETAIL,
    HEALTH_CHECK_PATH, REGISTER_PATH,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} has no port to dial")]
    NotDialable(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("peer answered {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("already registered with this peer")]
    AlreadyRegistered,

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl TransportError {
    /// HTTP status the peer answered with, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Rejected { status, .. } => Some(*status),
            TransportError::AlreadyRegistered => Some(400),
            _ => None,
        }
    }
}

/// Calls this node makes on remote peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// `POST /register` announcing `me` to `target`
    async fn register(
        &self,
        target: &PeerPublic,
        me: &PeerPublic,
    ) -> Result<RemoteRegisterResponse, TransportError>;

    /// `GET /health_check` on `target`
    async fn health_check(&self, target: &PeerPublic) -> Result<RemoteHealthResponse, TransportError>;
}

/// Run an outbound call under a deadline; running out is a transport failure
pub async fn bounded<T, F>(limit: Duration, target: &PeerPublic, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(target.to_string())),
    }
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(format!("HTTP client error: {}", e)))?;

        Ok(Self { client })
    }

    fn url(target: &PeerPublic, path: &str) -> Result<String, TransportError> {
        target
            .base_url()
            .map(|base| format!("{}{}", base, path))
            .ok_or_else(|| TransportError::NotDialable(target.address().to_string()))
    }

    fn send_error(target: &PeerPublic, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(target.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        target: &PeerPublic,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();

        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(target.to_string())
                } else {
                    TransportError::Decode(e.to_string())
                }
            });
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.detail)
            .unwrap_or(body);

        if status.as_u16() == 400 && detail.trim_end_matches('.') == ALREADY_REGISTERED_DETAIL {
            return Err(TransportError::AlreadyRegistered);
        }

        Err(TransportError::Rejected {
            status: status.as_u16(),
            detail,
        })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn register(
        &self,
        target: &PeerPublic,
        me: &PeerPublic,
    ) -> Result<RemoteRegisterResponse, TransportError> {
        let url = Self::url(target, REGISTER_PATH)?;

        let response = self
            .client
            .post(&url)
            .json(me)
            .send()
            .await
            .map_err(|e| Self::send_error(target, e))?;

        Self::decode(target, response).await
    }

    async fn health_check(&self, target: &PeerPublic) -> Result<RemoteHealthResponse, TransportError> {
        let url = Self::url(target, HEALTH_CHECK_PATH)?;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::send_error(target, e))?;

        Self::decode(target, response).await
    }
}
