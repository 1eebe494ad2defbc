use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Wire protocol served on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Socket family a listener binds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Address {
    pub network: Network,
    pub address: String,
}

impl Address {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
        }
    }
}

/// A bound-socket description attached to a host. Multiple hosts may carry
/// listeners with the same key; the listener manager deduplicates them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Listener {
    #[serde(default)]
    pub id: String,
    pub protocol: Protocol,
    pub address: Address,
}

impl Listener {
    pub fn new(id: impl Into<String>, protocol: Protocol, address: Address) -> Self {
        Self {
            id: id.into(),
            protocol,
            address,
        }
    }

    pub fn key(&self) -> ListenerKey {
        ListenerKey {
            protocol: self.protocol,
            network: self.address.network,
            address: self.address.address.clone(),
        }
    }
}

/// Identity of a bound socket: one socket exists per distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub protocol: Protocol,
    pub network: Network,
    pub address: String,
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.protocol, self.network, self.address)
    }
}

/// PEM-encoded certificate chain and private key for a host.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Certificate {
    pub cert: String,
    pub key: String,
}

impl Certificate {
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }
}

// Key material stays out of Debug output.
impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("cert", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HostOptions {
    /// At most one host per bound address may be the default; it answers
    /// TLS handshakes whose SNI matches no host name.
    #[serde(default)]
    pub default: bool,
}

/// A named virtual server: routing entry point, TLS identity and the set of
/// listeners that serve it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub cert: Option<Certificate>,
    #[serde(default)]
    pub options: HostOptions,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: Vec::new(),
            cert: None,
            options: HostOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::Config("host name cannot be empty".into()));
        }
        Ok(())
    }
}

/// Case-insensitive DNS label match: lowercase, trailing dot and port stripped.
pub fn normalize_host_name(name: &str) -> String {
    let name = name.rsplit_once(':').map_or(name, |(h, p)| {
        // Only strip a real port suffix, not the tail of an IPv6 literal.
        if p.chars().all(|c| c.is_ascii_digit()) && !h.is_empty() {
            h
        } else {
            name
        }
    });
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// A single origin URL. Identity is by id; the url may change underneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    /// Stable identity used for load-balancer membership and stats.
    pub fn key(&self) -> String {
        if self.id.is_empty() {
            self.url.clone()
        } else {
            self.id.clone()
        }
    }
}

/// A named pool of endpoints shared by reference between locations.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Upstream {
    pub id: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocationTimeouts {
    /// Durations in the `14s` / `500ms` form; empty means engine default.
    pub dial: String,
    pub read: String,
    pub write: String,
    pub tls_handshake: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocationLimits {
    /// Bytes of request body held in memory before spilling to disk.
    pub max_mem_body_bytes: i64,
    /// Hard cap on the request body; <= 0 means unlimited.
    pub max_body_bytes: i64,
}

impl Default for LocationLimits {
    fn default() -> Self {
        Self {
            max_mem_body_bytes: 0,
            max_body_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocationOptions {
    pub timeouts: LocationTimeouts,
    pub limits: LocationLimits,
    /// Boolean expression over attempt outcomes authorizing a retry,
    /// e.g. `IsNetworkError && !ResponseCodeIs(401)`. Empty selects the
    /// engine default (`IsNetworkError`).
    pub failover_predicate: String,
    /// Value for the X-Forwarded-Server header.
    pub hostname: String,
    /// Preserve and append to inbound X-Forwarded-* instead of replacing.
    pub trust_forward_header: bool,
}

/// A middleware occupying a chain slot. The chain key is `"{type}.{id}"`;
/// upserting a colliding key replaces the previous instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MiddlewareInstance {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MiddlewareInstance {
    pub fn chain_key(&self) -> String {
        format!("{}.{}", self.kind, self.id)
    }
}

/// A path-scoped forwarding unit within a host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Location {
    pub hostname: String,
    pub id: String,
    pub path: String,
    pub upstream: Upstream,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareInstance>,
    #[serde(default)]
    pub options: LocationOptions,
}

impl Location {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ProxyError::Config("location id cannot be empty".into()));
        }
        if self.hostname.trim().is_empty() {
            return Err(ProxyError::Config(format!(
                "location {} has no hostname",
                self.id
            )));
        }
        if self.path.trim().is_empty() {
            return Err(ProxyError::Config(format!(
                "location {} has no path",
                self.id
            )));
        }
        Ok(())
    }
}

/// Typed change events consumed from the configuration store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum ChangeEvent {
    HostAdded {
        host: Host,
    },
    HostDeleted {
        name: String,
    },
    HostCertUpdated {
        name: String,
        cert: Certificate,
    },
    HostListenerAdded {
        host: Host,
        listener: Listener,
    },
    HostListenerDeleted {
        host: Host,
        listener_id: String,
    },
    LocationAdded {
        host: Host,
        location: Location,
    },
    LocationDeleted {
        host: Host,
        location_id: String,
    },
    LocationUpstreamUpdated {
        host: Host,
        location: Location,
    },
    LocationPathUpdated {
        host: Host,
        location: Location,
    },
    LocationOptionsUpdated {
        host: Host,
        location: Location,
    },
    LocationMiddlewareAdded {
        host: Host,
        location: Location,
        middleware: MiddlewareInstance,
    },
    LocationMiddlewareUpdated {
        host: Host,
        location: Location,
        middleware: MiddlewareInstance,
    },
    LocationMiddlewareDeleted {
        host: Host,
        location: Location,
        middleware_type: String,
        middleware_id: String,
    },
    UpstreamAdded {
        upstream: Upstream,
    },
    UpstreamDeleted {
        upstream_id: String,
    },
    EndpointAdded {
        upstream: Upstream,
        endpoint: Endpoint,
        affected_locations: Vec<Location>,
    },
    EndpointUpdated {
        upstream: Upstream,
        endpoint: Endpoint,
        affected_locations: Vec<Location>,
    },
    EndpointDeleted {
        upstream: Upstream,
        endpoint_id: String,
        affected_locations: Vec<Location>,
    },
}

impl ChangeEvent {
    /// Decode an event off the wire. An unrecognized `kind` tag is a
    /// configuration error, not a panic.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ProxyError::Config(format!("bad change event: {e}")))
    }
}

/// Parses `750ms`, `14s`, `2m`, `1h` style durations used throughout the
/// location options and config file.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ProxyError::Config("empty duration".into()));
    }
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.');
    let (num, unit) = match split {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let value: f64 = num
        .parse()
        .map_err(|_| ProxyError::Config(format!("bad duration: {s}")))?;
    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(ProxyError::Config(format!("bad duration unit: {s}"))),
    };
    Ok(Duration::from_secs_f64(secs))
}

/// Like `parse_duration`, but empty selects the provided default.
pub fn parse_duration_or(s: &str, default: Duration) -> Result<Duration> {
    if s.trim().is_empty() {
        Ok(default)
    } else {
        parse_duration(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("14s").unwrap(), Duration::from_secs(14));
        assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn host_name_normalization() {
        assert_eq!(normalize_host_name("Example.COM."), "example.com");
        assert_eq!(normalize_host_name("localhost:31000"), "localhost");
        assert_eq!(normalize_host_name("[::1]:31000"), "[::1]");
    }

    #[test]
    fn endpoint_key_falls_back_to_url() {
        let e = Endpoint::new("", "http://localhost:5000");
        assert_eq!(e.key(), "http://localhost:5000");
        let e = Endpoint::new("e1", "http://localhost:5000");
        assert_eq!(e.key(), "e1");
    }

    #[test]
    fn middleware_chain_key() {
        let m = MiddlewareInstance {
            kind: "ratelimit".into(),
            id: "rl1".into(),
            priority: 0,
            payload: serde_json::Value::Null,
        };
        assert_eq!(m.chain_key(), "ratelimit.rl1");
    }

    #[test]
    fn unknown_event_kind_is_config_error() {
        let err = ChangeEvent::from_json(r#"{"kind":"HostExploded","name":"x"}"#).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn event_roundtrip() {
        let raw = r#"{"kind":"HostDeleted","name":"localhost"}"#;
        match ChangeEvent::from_json(raw).unwrap() {
            ChangeEvent::HostDeleted { name } => assert_eq!(name, "localhost"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
