//! Shared types and primitives used across the dswarm client crates.

pub mod address_filter;
pub mod retry;
pub mod types;

pub use types::{
    ContentFingerprint, FingerprintParseError, Multiaddr, PackageMeta, PeerId, PeerInfo,
    SourceKind,
};
