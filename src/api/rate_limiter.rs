//! Rate Limiting for inbound requests
//!
//! Each caller IP may make `max_per_minute` accepted requests in any sliding
//! one-minute window. Refused requests and malformed registrations count as
//! violations; enough of them ban the caller. A caller banned again after a
//! ban expired is banned for twice as long, up to `MAX_BAN_ESCALATION` times
//! the base duration.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Longest ban, as a multiple of the base ban duration
const MAX_BAN_ESCALATION: i32 = 16;

/// Idle windows after which an unbanned caller is forgotten
const IDLE_WINDOWS: i32 = 10;

pub struct RateLimiter {
    callers: HashMap<IpAddr, CallerState>,
    max_per_window: usize,
    max_violations: u32,
    ban_duration: Duration,
    window: Duration,
}

#[derive(Default)]
struct CallerState {
    /// Accepted requests inside the current window, oldest first
    accepted: VecDeque<DateTime<Utc>>,

    violations: u32,

    /// Bans served so far
    bans: u32,

    banned_until: Option<DateTime<Utc>>,

    last_request: Option<DateTime<Utc>>,
}

impl CallerState {
    fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.map(|t| now < t).unwrap_or(false)
    }

    fn forget_before(&mut self, cutoff: DateTime<Utc>) {
        while self.accepted.front().map(|t| *t <= cutoff).unwrap_or(false) {
            self.accepted.pop_front();
        }
    }
}

impl RateLimiter {
    pub fn new(max_per_minute: u32, max_violations: u32, ban_duration: Duration) -> Self {
        Self {
            callers: HashMap::new(),
            max_per_window: max_per_minute as usize,
            max_violations: max_violations.max(1),
            ban_duration,
            window: Duration::minutes(1),
        }
    }

    /// Whether a request from `ip` may proceed. Refusals count as violations.
    pub fn check_rate_limit(&mut self, ip: IpAddr) -> bool {
        self.check_rate_limit_at(ip, Utc::now())
    }

    pub fn check_rate_limit_at(&mut self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        let state = self.callers.entry(ip).or_default();
        state.last_request = Some(now);

        if state.is_banned(now) {
            debug!("IP {} is banned until {:?}", ip, state.banned_until);
            return false;
        }
        if state.banned_until.take().is_some() {
            // Served its ban: start clean, but remember it
            state.violations = 0;
            state.accepted.clear();
        }

        state.forget_before(now - self.window);

        if state.accepted.len() < self.max_per_window {
            state.accepted.push_back(now);
            return true;
        }

        warn!(
            "Rate limit exceeded for {}: {} requests in the last minute",
            ip,
            state.accepted.len()
        );
        self.violation(ip, now);
        false
    }

    /// Record a violation (e.g. a registration that fails validation)
    pub fn record_violation(&mut self, ip: IpAddr) {
        self.record_violation_at(ip, Utc::now())
    }

    pub fn record_violation_at(&mut self, ip: IpAddr, now: DateTime<Utc>) {
        self.callers.entry(ip).or_default().last_request = Some(now);
        self.violation(ip, now);
    }

    fn violation(&mut self, ip: IpAddr, now: DateTime<Utc>) {
        let state = self.callers.entry(ip).or_default();
        if state.is_banned(now) {
            return;
        }

        state.violations += 1;
        debug!("Violation recorded for {}: total {}", ip, state.violations);

        if state.violations >= self.max_violations {
            let factor = 2i32.saturating_pow(state.bans).min(MAX_BAN_ESCALATION);
            let duration = self.ban_duration * factor;
            state.banned_until = Some(now + duration);
            state.bans += 1;
            state.violations = 0;
            warn!("⛔ IP {} banned for {}s (ban #{})", ip, duration.num_seconds(), state.bans);
        }
    }

    /// Ban expiry for an IP that is currently banned
    pub fn banned_until(&self, ip: &IpAddr) -> Option<DateTime<Utc>> {
        self.banned_until_at(ip, Utc::now())
    }

    pub fn banned_until_at(&self, ip: &IpAddr, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.callers
            .get(ip)
            .and_then(|s| s.banned_until)
            .filter(|t| now < *t)
    }

    pub fn tracked_count(&self) -> usize {
        self.callers.len()
    }

    pub fn banned_count(&self) -> usize {
        let now = Utc::now();
        self.callers.values().filter(|s| s.is_banned(now)).count()
    }

    /// Forget callers that are neither banned nor recently active
    pub fn cleanup(&mut self) {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&mut self, now: DateTime<Utc>) {
        let idle_before = now - self.window * IDLE_WINDOWS;
        self.callers.retain(|_, state| {
            state.is_banned(now) || state.last_request.map(|t| t > idle_before).unwrap_or(false)
        });
    }
}
