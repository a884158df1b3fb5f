//! Core data types shared by every dswarm service.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A SHA-256 content fingerprint.
///
/// Rendered as 64 lowercase hex characters on the wire and in DHT keys.
/// Any content entering the cache has been hashed end-to-end and compared
/// byte-equal against one of these.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFingerprint([u8; 32]);

impl ContentFingerprint {
    pub const HEX_LEN: usize = 64;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash `data` with SHA-256.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The DHT provider key for this content: `/pkg/<hex>`.
    pub fn dht_key(&self) -> String {
        format!("/pkg/{}", self.to_hex())
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentFingerprint({})", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FingerprintParseError {
    #[error("fingerprint must be {expected} hex characters, got {got}", expected = ContentFingerprint::HEX_LEN)]
    BadLength { got: usize },
    #[error("fingerprint contains non-hex characters")]
    BadHex,
}

impl FromStr for ContentFingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(FingerprintParseError::BadLength { got: s.len() });
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut bytes)
            .map_err(|_| FingerprintParseError::BadHex)?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentFingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentFingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque peer identity, rendered as the hex id the swarm layer derives
/// from a peer's public key.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The host component of a [`Multiaddr`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MultiaddrHost {
    Ip(IpAddr),
    Dns(String),
}

/// A minimal multiaddress: enough structure to extract the IP / port of
/// `/ip4/<a>/tcp/<p>`-style addresses while carrying anything else
/// through opaquely.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    raw: String,
    host: Option<MultiaddrHost>,
    port: Option<u16>,
}

impl Multiaddr {
    /// Parse a multiaddress string. Unknown protocol components are kept
    /// verbatim; only the host and TCP port are interpreted.
    pub fn parse(raw: &str) -> Self {
        let mut host = None;
        let mut port = None;
        let mut parts = raw.split('/');
        // A leading '/' yields an empty first segment.
        parts.next();
        while let Some(proto) = parts.next() {
            match proto {
                "ip4" | "ip6" => {
                    if let Some(addr) = parts.next() {
                        if let Ok(ip) = addr.parse::<IpAddr>() {
                            host.get_or_insert(MultiaddrHost::Ip(ip));
                        }
                    }
                }
                "dns" | "dns4" | "dns6" | "dnsaddr" => {
                    if let Some(name) = parts.next() {
                        host.get_or_insert(MultiaddrHost::Dns(name.to_owned()));
                    }
                }
                "tcp" => {
                    if let Some(p) = parts.next() {
                        if let Ok(p) = p.parse::<u16>() {
                            port.get_or_insert(p);
                        }
                    }
                }
                // Skip the value of protocols we do not interpret.
                "p2p" | "udp" | "quic-v1" | "ws" | "wss" => {
                    if proto == "p2p" || proto == "udp" {
                        parts.next();
                    }
                }
                _ => {}
            }
        }
        Self {
            raw: raw.to_owned(),
            host,
            port,
        }
    }

    /// The IP component, if the address carries one.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Some(MultiaddrHost::Ip(ip)) => Some(ip),
            _ => None,
        }
    }

    pub fn dns_name(&self) -> Option<&str> {
        match &self.host {
            Some(MultiaddrHost::Dns(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// A dialable socket address, for addresses with an explicit IP and
    /// TCP port. DNS-based addresses resolve at dial time instead.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match (self.ip(), self.port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({})", self.raw)
    }
}

impl FromStr for Multiaddr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// A peer together with its advertised addresses. Addresses resolving to
/// private ranges are stripped before the info is acted on.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }
}

/// Package metadata as loaded from an APT `Packages` index. Immutable
/// once loaded.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PackageMeta {
    pub sha256: ContentFingerprint,
    pub size: u64,
    pub filename: String,
    pub repo: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub architecture: Option<String>,
}

/// Where response bytes came from, as reported in the `X-Source` header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SourceKind {
    Cache,
    Peer,
    Mirror,
    Mixed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Cache => "cache",
            SourceKind::Peer => "peer",
            SourceKind::Mirror => "mirror",
            SourceKind::Mixed => "mixed",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
