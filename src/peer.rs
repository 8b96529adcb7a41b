//! Peer records
//!
//! A peer has two projections. [`PeerPublic`] is the only shape that ever
//! crosses the wire. [`PeerInternal`] is the registry document and carries
//! bookkeeping that is never shared with, or accepted from, a remote peer.
//!
//! Inbound records arrive as [`RawPeer`] and only become a [`PeerPublic`]
//! through [`PeerPublic::validate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

use crate::config::OperatingMode;

/// Longest accepted address (DNS name limit)
pub const MAX_ADDRESS_LEN: usize = 253;

/// Longest accepted display name
pub const MAX_DISPLAY_NAME_LEN: usize = 100;

/// Lowest accepted port (well-known ports are refused)
pub const MIN_PORT: i64 = 1024;

/// Highest accepted port
pub const MAX_PORT: i64 = 65535;

// =============================================================================
// VALIDATION
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("address is empty")]
    EmptyAddress,

    #[error("address is too long ({0} chars, max 253)")]
    AddressTooLong(usize),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("address {0} is not publicly routable")]
    NotPubliclyRoutable(String),

    #[error("port {0} is outside 1024-65535")]
    PortOutOfRange(i64),

    #[error("display name is empty")]
    EmptyDisplayName,

    #[error("display name is too long ({0} chars, max 100)")]
    DisplayNameTooLong(usize),

    #[error("display name may only contain letters, digits, spaces and hyphens: {0:?}")]
    InvalidDisplayName(String),

    #[error("address {0} belongs to this node")]
    SelfAddress(String),
}

/// Unvalidated peer record as received from the network or the config file.
///
/// Unknown fields (including any attempt to set private bookkeeping such as
/// `allow_listed`) are ignored by the decoder. `ip` and `name` are accepted
/// as legacy spellings of `address` and `display_name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPeer {
    #[serde(alias = "ip")]
    pub address: String,

    #[serde(default)]
    pub port: Option<i64>,

    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
}

impl From<&PeerPublic> for RawPeer {
    fn from(peer: &PeerPublic) -> Self {
        Self {
            address: peer.address.clone(),
            port: peer.port.map(i64::from),
            display_name: peer.display_name.clone(),
        }
    }
}

/// Normalise an address to its registry key.
///
/// IP literals are rendered in canonical form (so `::0001` and `::1` are the
/// same peer), hostnames are lower-cased with any trailing dot removed.
pub fn normalize_address(input: &str, mode: OperatingMode) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyAddress);
    }
    if trimmed.len() > MAX_ADDRESS_LEN {
        return Err(ValidationError::AddressTooLong(trimmed.len()));
    }

    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        if mode == OperatingMode::Production && !is_publicly_routable(&ip) {
            return Err(ValidationError::NotPubliclyRoutable(ip.to_string()));
        }
        return Ok(ip.to_string());
    }

    let host = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();
    if !is_valid_hostname(&host) {
        return Err(ValidationError::MalformedAddress(trimmed.to_string()));
    }

    if mode == OperatingMode::Production && !is_public_hostname(&host) {
        return Err(ValidationError::NotPubliclyRoutable(host));
    }

    Ok(host)
}

fn is_valid_hostname(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();

    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    // All-numeric names are failed IPv4 literals like 999.1.1.1
    let all_numeric = labels
        .iter()
        .all(|label| label.chars().all(|c| c.is_ascii_digit()));

    labels_ok && !all_numeric
}

fn is_public_hostname(host: &str) -> bool {
    host.contains('.')
        && host != "localhost"
        && !host.ends_with(".localhost")
        && !host.ends_with(".local")
}

/// Whether an IP address can be reached from the public internet
pub fn is_publicly_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(&v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();

    let shared = a == 100 && (64..=127).contains(&b); // 100.64.0.0/10
    let benchmarking = a == 198 && (b == 18 || b == 19); // 198.18.0.0/15
    let reserved = a >= 240; // 240.0.0.0/4
    let this_network = a == 0; // 0.0.0.0/8

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || benchmarking
        || reserved
        || this_network)
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();

    let unique_local = (segments[0] & 0xfe00) == 0xfc00; // fc00::/7
    let link_local = (segments[0] & 0xffc0) == 0xfe80; // fe80::/10
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8; // 2001:db8::/32

    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || unique_local
        || link_local
        || documentation)
}

fn validate_port(port: Option<i64>) -> Result<Option<u16>, ValidationError> {
    match port {
        None => Ok(None),
        Some(p) if (MIN_PORT..=MAX_PORT).contains(&p) => Ok(Some(p as u16)),
        Some(p) => Err(ValidationError::PortOutOfRange(p)),
    }
}

fn validate_display_name(name: Option<String>) -> Result<Option<String>, ValidationError> {
    let Some(name) = name else {
        return Ok(None);
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyDisplayName);
    }

    let len = name.chars().count();
    if len > MAX_DISPLAY_NAME_LEN {
        return Err(ValidationError::DisplayNameTooLong(len));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-')
    {
        return Err(ValidationError::InvalidDisplayName(name.to_string()));
    }

    Ok(Some(name.to_string()))
}

// =============================================================================
// PUBLIC PROJECTION
// =============================================================================

/// The externally visible shape of a peer.
///
/// Fields are private: a `PeerPublic` can only be obtained through
/// [`PeerPublic::validate`] or by projecting a [`PeerInternal`], so every
/// value in circulation has passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerPublic {
    address: String,
    port: Option<u16>,
    display_name: Option<String>,
}

impl PeerPublic {
    /// Validate an untrusted record under the given operating mode
    pub fn validate(raw: RawPeer, mode: OperatingMode) -> Result<Self, ValidationError> {
        Ok(Self {
            address: normalize_address(&raw.address, mode)?,
            port: validate_port(raw.port)?,
            display_name: validate_display_name(raw.display_name)?,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Peer omitted both port and display name
    pub fn is_minimal(&self) -> bool {
        self.port.is_none() && self.display_name.is_none()
    }

    /// Peer can be contacted over HTTP
    pub fn is_dialable(&self) -> bool {
        self.port.is_some()
    }

    /// `http://host:port`, or `None` for a peer without a port
    pub fn base_url(&self) -> Option<String> {
        let port = self.port?;
        if self.address.contains(':') {
            Some(format!("http://[{}]:{}", self.address, port))
        } else {
            Some(format!("http://{}:{}", self.address, port))
        }
    }

    /// Fresh internal record: seen now, empty history, all flags clear
    pub fn to_internal(&self) -> PeerInternal {
        PeerInternal::from_public(self.clone(), Utc::now())
    }

    /// Take any optional fields the newer record supplies
    pub(crate) fn absorb(&mut self, newer: &PeerPublic) {
        if newer.port.is_some() {
            self.port = newer.port;
        }
        if newer.display_name.is_some() {
            self.display_name = newer.display_name.clone();
        }
    }
}

impl std::fmt::Display for PeerPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) if self.address.contains(':') => write!(f, "[{}]:{}", self.address, port),
            Some(port) => write!(f, "{}:{}", self.address, port),
            None => write!(f, "{}", self.address),
        }
    }
}

// =============================================================================
// INTERNAL PROJECTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Request received from the peer
    Inbound,

    /// Request sent to the peer
    Outbound,
}

/// One entry of a peer's request history, ordered by timestamp first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub method: String,
    pub endpoint: String,
    pub response_code: u16,
}

impl RequestRecord {
    pub fn inbound(method: &str, endpoint: &str, response_code: u16) -> Self {
        Self::new(Direction::Inbound, method, endpoint, response_code)
    }

    pub fn outbound(method: &str, endpoint: &str, response_code: u16) -> Self {
        Self::new(Direction::Outbound, method, endpoint, response_code)
    }

    fn new(direction: Direction, method: &str, endpoint: &str, response_code: u16) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            response_code,
        }
    }
}

/// Registry document for a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInternal {
    peer: PeerPublic,

    /// Last successful contact, never moves backwards
    pub last_seen: DateTime<Utc>,

    /// Oldest first, bounded by the registry
    pub request_history: Vec<RequestRecord>,

    /// Peer registered with this node
    pub activated: bool,

    /// This node registered with the peer
    pub registered: bool,

    pub allow_listed: bool,
    pub deny_listed: bool,
    pub rate_limited_until: Option<DateTime<Utc>>,

    /// Presumed dead by the membership monitor
    pub inactive: bool,

    conforms_to_network_standard: bool,
}

impl PeerInternal {
    pub fn from_public(peer: PeerPublic, last_seen: DateTime<Utc>) -> Self {
        let conforms_to_network_standard = peer.is_minimal();
        Self {
            peer,
            last_seen,
            request_history: Vec::new(),
            activated: false,
            registered: false,
            allow_listed: false,
            deny_listed: false,
            rate_limited_until: None,
            inactive: false,
            conforms_to_network_standard,
        }
    }

    pub fn public(&self) -> &PeerPublic {
        &self.peer
    }

    pub fn address(&self) -> &str {
        self.peer.address()
    }

    /// Fixed at creation: true iff the peer supplied neither port nor name
    pub fn conforms_to_network_standard(&self) -> bool {
        self.conforms_to_network_standard
    }

    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.map(|t| now < t).unwrap_or(false)
    }

    /// Eligible to be handed out in a peer sample
    pub fn is_shareable(&self) -> bool {
        !self.deny_listed && !self.inactive && self.peer.is_dialable()
    }

    pub(crate) fn public_mut(&mut self) -> &mut PeerPublic {
        &mut self.peer
    }

    /// Recompute minimal conformance after the public record changed
    pub(crate) fn refresh_conformance(&mut self) {
        self.conforms_to_network_standard = self.peer.is_minimal();
    }
}

// =============================================================================
// PROJECTION
// =============================================================================

/// Either projection of a peer, for containers that mix the two
#[derive(Debug, Clone, PartialEq)]
pub enum AnyPeer {
    Public(PeerPublic),
    Internal(PeerInternal),
}

impl From<PeerPublic> for AnyPeer {
    fn from(peer: PeerPublic) -> Self {
        AnyPeer::Public(peer)
    }
}

impl From<PeerInternal> for AnyPeer {
    fn from(peer: PeerInternal) -> Self {
        AnyPeer::Internal(peer)
    }
}

/// Strip every private field from a peer value, however it is nested.
///
/// Implemented for both projections and for the standard containers of
/// them; a shape without an implementation does not compile.
pub trait ToPublic {
    type Output;

    fn to_public(&self) -> Self::Output;
}

impl ToPublic for PeerPublic {
    type Output = PeerPublic;

    fn to_public(&self) -> PeerPublic {
        self.clone()
    }
}

impl ToPublic for PeerInternal {
    type Output = PeerPublic;

    fn to_public(&self) -> PeerPublic {
        self.peer.clone()
    }
}

impl ToPublic for AnyPeer {
    type Output = PeerPublic;

    fn to_public(&self) -> PeerPublic {
        match self {
            AnyPeer::Public(p) => p.to_public(),
            AnyPeer::Internal(p) => p.to_public(),
        }
    }
}

impl<T: ToPublic> ToPublic for [T] {
    type Output = Vec<T::Output>;

    fn to_public(&self) -> Self::Output {
        self.iter().map(ToPublic::to_public).collect()
    }
}

impl<T: ToPublic> ToPublic for Vec<T> {
    type Output = Vec<T::Output>;

    fn to_public(&self) -> Self::Output {
        self.as_slice().to_public()
    }
}

impl<T: ToPublic> ToPublic for Option<T> {
    type Output = Option<T::Output>;

    fn to_public(&self) -> Self::Output {
        self.as_ref().map(ToPublic::to_public)
    }
}

impl<A: ToPublic, B: ToPublic> ToPublic for (A, B) {
    type Output = (A::Output, B::Output);

    fn to_public(&self) -> Self::Output {
        (self.0.to_public(), self.1.to_public())
    }
}

impl<T> ToPublic for BTreeSet<T>
where
    T: ToPublic,
    T::Output: Ord,
{
    type Output = BTreeSet<T::Output>;

    fn to_public(&self) -> Self::Output {
        self.iter().map(ToPublic::to_public).collect()
    }
}

impl<T> ToPublic for HashSet<T>
where
    T: ToPublic,
    T::Output: Eq + Hash,
{
    type Output = HashSet<T::Output>;

    fn to_public(&self) -> Self::Output {
        self.iter().map(ToPublic::to_public).collect()
    }
}

impl<K: Clone + Ord, V: ToPublic> ToPublic for BTreeMap<K, V> {
    type Output = BTreeMap<K, V::Output>;

    fn to_public(&self) -> Self::Output {
        self.iter().map(|(k, v)| (k.clone(), v.to_public())).collect()
    }
}

impl<K: Clone + Eq + Hash, V: ToPublic> ToPublic for HashMap<K, V> {
    type Output = HashMap<K, V::Output>;

    fn to_public(&self) -> Self::Output {
        self.iter().map(|(k, v)| (k.clone(), v.to_public())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(address: &str, port: Option<i64>, name: Option<&str>) -> RawPeer {
        RawPeer {
            address: address.to_string(),
            port,
            display_name: name.map(str::to_string),
        }
    }

    fn dev(address: &str, port: Option<i64>, name: Option<&str>) -> Result<PeerPublic, ValidationError> {
        PeerPublic::validate(raw(address, port, name), OperatingMode::Development)
    }

    fn prod(address: &str) -> Result<PeerPublic, ValidationError> {
        PeerPublic::validate(raw(address, Some(8000), None), OperatingMode::Production)
    }

    #[test]
    fn test_private_address_depends_on_mode() {
        assert!(dev("10.0.0.5", Some(8000), None).is_ok());
        assert_eq!(
            prod("10.0.0.5"),
            Err(ValidationError::NotPubliclyRoutable("10.0.0.5".to_string()))
        );

        for addr in ["127.0.0.1", "192.168.1.1", "169.254.0.1", "100.64.1.1", "0.0.0.0", "::1", "fd00::1", "fe80::1", "::ffff:10.0.0.1"] {
            assert!(prod(addr).is_err(), "{} should be rejected in production", addr);
        }
        for addr in ["8.8.8.8", "2606:4700::1111", "seed.example.org"] {
            assert!(prod(addr).is_ok(), "{} should be accepted in production", addr);
        }
    }

    #[test]
    fn test_port_bounds() {
        assert_eq!(dev("10.0.0.5", Some(80), None), Err(ValidationError::PortOutOfRange(80)));
        assert_eq!(dev("10.0.0.5", Some(70000), None), Err(ValidationError::PortOutOfRange(70000)));
        assert_eq!(dev("10.0.0.5", Some(8080), None).unwrap().port(), Some(8080));
        assert_eq!(dev("10.0.0.5", Some(1024), None).unwrap().port(), Some(1024));
        assert_eq!(dev("10.0.0.5", Some(65535), None).unwrap().port(), Some(65535));
    }

    #[test]
    fn test_display_name_rules() {
        assert!(matches!(
            dev("10.0.0.5", None, Some("node #1!")),
            Err(ValidationError::InvalidDisplayName(_))
        ));
        assert_eq!(
            dev("10.0.0.5", None, Some("  node-1 ")).unwrap().display_name(),
            Some("node-1")
        );
        assert_eq!(dev("10.0.0.5", None, Some("   ")), Err(ValidationError::EmptyDisplayName));

        let long = "a".repeat(101);
        assert_eq!(
            dev("10.0.0.5", None, Some(&long)),
            Err(ValidationError::DisplayNameTooLong(101))
        );
        assert!(dev("10.0.0.5", None, Some(&"a".repeat(100))).is_ok());
    }

    #[test]
    fn test_address_normalization() {
        assert_eq!(dev("::0001", None, None).unwrap().address(), "::1");
        assert_eq!(dev("[::1]", None, None).unwrap().address(), "::1");
        assert_eq!(dev("Node-A.Example.org.", None, None).unwrap().address(), "node-a.example.org");
        assert_eq!(dev(" 10.0.0.5 ", None, None).unwrap().address(), "10.0.0.5");

        assert_eq!(dev("", None, None), Err(ValidationError::EmptyAddress));
        assert!(matches!(dev("999.1.1.1", None, None), Err(ValidationError::MalformedAddress(_))));
        assert!(matches!(dev("bad host", None, None), Err(ValidationError::MalformedAddress(_))));

        // Single-label names only make sense on a private network
        assert!(dev("peer0", Some(8000), None).is_ok());
        assert!(prod("peer0").is_err());
        assert!(prod("localhost").is_err());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            dev("10.0.0.5", Some(8000), None).unwrap().base_url().as_deref(),
            Some("http://10.0.0.5:8000")
        );
        assert_eq!(
            dev("::1", Some(8000), None).unwrap().base_url().as_deref(),
            Some("http://[::1]:8000")
        );
        assert_eq!(dev("10.0.0.5", None, None).unwrap().base_url(), None);
    }

    #[test]
    fn test_minimal_conformance() {
        let minimal = dev("10.0.0.5", None, None).unwrap();
        assert!(minimal.is_minimal());
        assert!(!minimal.is_dialable());

        let internal = minimal.to_internal();
        assert!(internal.conforms_to_network_standard());
        assert!(!internal.is_shareable());

        let full = dev("10.0.0.6", Some(8000), Some("node")).unwrap().to_internal();
        assert!(!full.conforms_to_network_standard());
        assert!(full.is_shareable());
    }

    #[test]
    fn test_wire_decoding_ignores_private_fields() {
        let json = r#"{
            "ip": "10.0.0.5",
            "port": 8000,
            "name": "node-1",
            "allow_listed": true,
            "activated": true,
            "request_history": [{"endpoint": "/x"}]
        }"#;
        let raw: RawPeer = serde_json::from_str(json).unwrap();
        assert_eq!(raw, self::raw("10.0.0.5", Some(8000), Some("node-1")));

        let peer = PeerPublic::validate(raw, OperatingMode::Development).unwrap();
        let internal = peer.to_internal();
        assert!(!internal.allow_listed);
        assert!(!internal.activated);
        assert!(internal.request_history.is_empty());
    }

    #[test]
    fn test_public_serialization_has_no_private_fields() {
        let mut internal = dev("10.0.0.5", Some(8000), Some("node-1")).unwrap().to_internal();
        internal.allow_listed = true;
        internal.request_history.push(RequestRecord::inbound("POST", "/register", 200));

        let value = serde_json::to_value(internal.to_public()).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec!["address", "display_name", "port"]);
    }

    #[test]
    fn test_projection_over_nested_shapes() {
        let a = dev("10.0.0.1", Some(8000), None).unwrap();
        let b = dev("10.0.0.2", Some(8000), Some("b")).unwrap();
        let mut b_internal = b.to_internal();
        b_internal.deny_listed = true;

        // Scalars
        assert_eq!(b_internal.to_public(), b);
        assert_eq!(a.to_public(), a);

        // Mixed list
        let mixed: Vec<AnyPeer> = vec![a.clone().into(), b_internal.clone().into()];
        assert_eq!(mixed.to_public(), vec![a.clone(), b.clone()]);

        // Set
        let set: BTreeSet<PeerPublic> = [a.clone(), b.clone()].into_iter().collect();
        assert_eq!(set.to_public(), set);

        // Nested map of lists
        let mut nested: HashMap<String, Vec<Option<AnyPeer>>> = HashMap::new();
        nested.insert("x".to_string(), vec![Some(b_internal.into()), None]);
        let projected = nested.to_public();
        assert_eq!(projected["x"], vec![Some(b.clone()), None]);

        // Tuple
        assert_eq!((a.clone(), vec![b.clone()]).to_public(), (a, vec![b]));
    }

    #[test]
    fn test_projection_is_injective_on_address() {
        let peers: Vec<PeerInternal> = (1..=5)
            .map(|i| dev(&format!("10.0.0.{}", i), Some(8000), None).unwrap().to_internal())
            .collect();

        let addresses: HashSet<String> = peers
            .to_public()
            .into_iter()
            .map(|p| p.address().to_string())
            .collect();
        assert_eq!(addresses.len(), peers.len());
    }
}
