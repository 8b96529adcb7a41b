//! Inbound registration
//!
//! Validates peers that announce themselves, records them, and answers with
//! this node's record plus a sample of the registry. Also serves the peer
//! list and health check.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::rate_limiter::RateLimiter;
use super::Metrics;
use crate::config::OperatingMode;
use crate::peer::{PeerPublic, RawPeer, RequestRecord, ValidationError};
use crate::protocol::{
    ErrorResponse, HealthResponse, PeerListResponse, RegisterResponse, ALREADY_REGISTERED_DETAIL,
    PEER_LIST_PATH, REGISTER_PATH, UNHEALTHY_DETAIL,
};
use crate::registry::{PeerMutation, PeerStore, RegistryStats, SampleLimit, StoreError, UpsertOutcome};

/// Tracked caller IPs above which idle limiter entries are dropped
const LIMITER_CLEANUP_THRESHOLD: usize = 10_000;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("{}", ALREADY_REGISTERED_DETAIL)]
    AlreadyRegistered,

    #[error("peer is not allowed to register")]
    Forbidden,

    #[error("too many requests")]
    RateLimited,

    #[error("{}", UNHEALTHY_DETAIL)]
    Unhealthy,

    #[error("registry error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) | ApiError::AlreadyRegistered => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unhealthy | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = match &self {
            ApiError::Store(e) => {
                error!("Registry failure while serving request: {}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (self.status(), Json(ErrorResponse { detail })).into_response()
    }
}

/// Handles the inbound side of the protocol
pub struct RegistrationService {
    store: Arc<dyn PeerStore>,
    me: PeerPublic,
    mode: OperatingMode,
    share_limit: SampleLimit,
    allow_listed_only: bool,
    cooldown: Duration,
    rate_limiter: Mutex<RateLimiter>,
    metrics: Arc<Metrics>,
}

impl RegistrationService {
    pub fn new(
        me: PeerPublic,
        mode: OperatingMode,
        store: Arc<dyn PeerStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            me,
            mode,
            share_limit: SampleLimit::AtMost(50),
            allow_listed_only: false,
            cooldown: Duration::seconds(60),
            rate_limiter: Mutex::new(RateLimiter::new(60, 5, Duration::seconds(600))),
            metrics,
        }
    }

    pub fn with_share_limit(mut self, limit: SampleLimit, allow_listed_only: bool) -> Self {
        self.share_limit = limit;
        self.allow_listed_only = allow_listed_only;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Mutex::new(limiter);
        self
    }

    pub fn me(&self) -> &PeerPublic {
        &self.me
    }

    /// `POST /register`
    pub async fn handle_register(
        &self,
        raw: RawPeer,
        caller: Option<IpAddr>,
    ) -> Result<RegisterResponse, ApiError> {
        let now = Utc::now();

        let peer = match self.validate_incoming(raw) {
            Ok(peer) => peer,
            Err(e) => {
                debug!("Rejected registration from {:?}: {}", caller, e);
                self.metrics.inc_registrations_rejected();
                if let Some(ip) = caller {
                    self.rate_limiter.lock().await.record_violation(ip);
                }
                return Err(e.into());
            }
        };

        let existing = self.store.find_by_address(peer.address()).await?;

        if self.is_denied(existing.as_ref().map(|p| p.deny_listed), caller).await? {
            info!("🚫 Refused registration from deny-listed peer {}", peer);
            self.metrics.inc_registrations_rejected();
            return Err(ApiError::Forbidden);
        }

        if existing.as_ref().map(|p| p.is_rate_limited(now)).unwrap_or(false) {
            self.metrics.inc_rate_limited();
            return Err(ApiError::RateLimited);
        }

        if let Some(ip) = caller {
            if !self.is_allow_listed(ip).await? {
                self.enforce_rate_limit(ip, &peer).await?;
            }
        }

        if let Some(existing) = &existing {
            if existing.activated && now - existing.last_seen < self.cooldown {
                debug!("Peer {} registered again within the cooldown", peer);
                self.store.touch_last_seen(peer.address()).await?;
                self.store
                    .append_history(peer.address(), RequestRecord::inbound("POST", REGISTER_PATH, 400))
                    .await?;
                self.metrics.inc_registrations_rejected();
                return Err(ApiError::AlreadyRegistered);
            }
        }

        let mut record = peer.to_internal();
        record.activated = true;
        record
            .request_history
            .push(RequestRecord::inbound("POST", REGISTER_PATH, 200));

        let outcome = self.store.upsert(record).await?;
        match outcome {
            UpsertOutcome::Inserted => info!("📝 New peer registered: {}", peer),
            UpsertOutcome::Updated => debug!("Peer re-registered: {}", peer),
        }
        self.metrics.inc_registrations_accepted();

        let exclude: HashSet<String> = [peer.address().to_string(), self.me.address().to_string()]
            .into_iter()
            .collect();
        let peer_list = self
            .store
            .sample(&exclude, self.allow_listed_only, self.share_limit)
            .await?;

        Ok(RegisterResponse {
            peer: self.me.clone(),
            peer_list,
        })
    }

    /// `GET /peer_list`
    pub async fn peer_list(&self, caller: Option<IpAddr>) -> Result<PeerListResponse, ApiError> {
        if let Some(ip) = caller {
            if self.is_denied(None, Some(ip)).await? {
                return Err(ApiError::Forbidden);
            }
            let mut limiter = self.rate_limiter.lock().await;
            if !limiter.check_rate_limit(ip) {
                self.metrics.inc_rate_limited();
                debug!("Rate limited {} on {}", ip, PEER_LIST_PATH);
                return Err(ApiError::RateLimited);
            }
        }

        let exclude: HashSet<String> = [self.me.address().to_string()].into_iter().collect();
        let peer_list = self
            .store
            .sample(&exclude, self.allow_listed_only, self.share_limit)
            .await?;

        Ok(PeerListResponse { peer_list })
    }

    /// `GET /health_check`
    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        match self.store.count().await {
            Ok(_) => Ok(HealthResponse::ok(self.me.clone())),
            Err(e) => {
                error!("Health check failed: {}", e);
                Err(ApiError::Unhealthy)
            }
        }
    }

    pub async fn stats(&self) -> Result<RegistryStats, ApiError> {
        Ok(self.store.stats().await?)
    }

    pub async fn banned_callers(&self) -> usize {
        self.rate_limiter.lock().await.banned_count()
    }

    fn validate_incoming(&self, raw: RawPeer) -> Result<PeerPublic, ValidationError> {
        let peer = PeerPublic::validate(raw, self.mode)?;
        if peer.address() == self.me.address() {
            return Err(ValidationError::SelfAddress(peer.address().to_string()));
        }
        Ok(peer)
    }

    /// Deny list applies to the claimed address and to the caller's own IP
    async fn is_denied(&self, claimed: Option<bool>, caller: Option<IpAddr>) -> Result<bool, StoreError> {
        if claimed.unwrap_or(false) {
            return Ok(true);
        }
        match caller {
            Some(ip) => Ok(self
                .store
                .find_by_address(&ip.to_string())
                .await?
                .map(|p| p.deny_listed)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Limiter exemption belongs to the caller's own IP, whatever it claims
    async fn is_allow_listed(&self, caller: IpAddr) -> Result<bool, StoreError> {
        Ok(self
            .store
            .find_by_address(&caller.to_string())
            .await?
            .map(|p| p.allow_listed)
            .unwrap_or(false))
    }

    async fn enforce_rate_limit(&self, ip: IpAddr, peer: &PeerPublic) -> Result<(), ApiError> {
        let (allowed, banned_until) = {
            let mut limiter = self.rate_limiter.lock().await;
            if limiter.tracked_count() > LIMITER_CLEANUP_THRESHOLD {
                limiter.cleanup();
            }
            let allowed = limiter.check_rate_limit(ip);
            (allowed, limiter.banned_until(&ip))
        };

        if allowed {
            return Ok(());
        }

        self.metrics.inc_rate_limited();

        // Only a caller registering its own address can get that record banned
        if let Some(until) = banned_until {
            if ip.to_string() == peer.address() {
                warn!("⛔ Peer {} rate limited until {}", peer, until);
                self.store
                    .apply(peer.address(), PeerMutation::RateLimitedUntil(Some(until)))
                    .await?;
            }
        }

        Err(ApiError::RateLimited)
    }
}
