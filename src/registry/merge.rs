//! Record merge rules
//!
//! Applied by the registry when an upsert hits an existing record. The rules
//! make concurrent upserts of one peer converge regardless of order:
//! `last_seen` takes the maximum, flags accumulate, `rate_limited_until`
//! takes the later deadline and request histories are unioned.

use chrono::{DateTime, Utc};

use crate::peer::{PeerInternal, RequestRecord};

/// Merge `incoming` into `existing` as of `now`
pub fn merge_into(
    existing: &mut PeerInternal,
    incoming: PeerInternal,
    now: DateTime<Utc>,
    history_limit: usize,
) {
    existing.public_mut().absorb(incoming.public());
    existing.refresh_conformance();

    existing.last_seen = existing.last_seen.max(incoming.last_seen).max(now);

    existing.activated |= incoming.activated;
    existing.registered |= incoming.registered;
    existing.allow_listed |= incoming.allow_listed;
    existing.deny_listed |= incoming.deny_listed;

    existing.rate_limited_until = match (existing.rate_limited_until, incoming.rate_limited_until) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    // Fresh again
    existing.inactive = false;

    union_history(&mut existing.request_history, incoming.request_history, history_limit);
}

/// Union two histories, keeping the newest `limit` entries in order
pub fn union_history(history: &mut Vec<RequestRecord>, incoming: Vec<RequestRecord>, limit: usize) {
    for entry in incoming {
        if !history.contains(&entry) {
            history.push(entry);
        }
    }
    history.sort();
    truncate_history(history, limit);
}

/// Append one entry, dropping the oldest beyond `limit`
pub fn append_bounded(history: &mut Vec<RequestRecord>, entry: RequestRecord, limit: usize) {
    history.push(entry);
    truncate_history(history, limit);
}

pub fn truncate_history(history: &mut Vec<RequestRecord>, limit: usize) {
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}
